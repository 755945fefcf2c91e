//! Line-oriented durable append logs.
//!
//! Every durable artifact in the pipeline (station outbox, broker pending
//! log, central received log, the audit trails) is an append-only file of
//! ` | `-separated records, written with an fsync before the append is
//! acknowledged. Each log is owned by exactly one process; the write path
//! is single-writer behind the internal lock.

use std::{
	fs,
	fs::{File, OpenOptions},
	io::Write,
	marker::PhantomData,
	path::{Path, PathBuf},
	sync::Mutex,
};

use chrono::{DateTime, Utc};

use vf_primitives::{BallotId, StoreError};

pub const FIELD_SEPARATOR: &str = " | ";

/// A record that can be journaled as a single line.
pub trait LogRecord: Sized + Send + 'static {
	/// One line, no newline, fields joined by [`FIELD_SEPARATOR`].
	fn encode(&self) -> String;
	fn decode(line: &str) -> Result<Self, String>;
}

pub struct AppendLog<R> {
	path: PathBuf,
	file: Mutex<File>,
	_record: PhantomData<R>,
}

impl<R: LogRecord> AppendLog<R> {
	/// Opens (creating if absent) the log and replays its contents.
	/// Returns the log handle together with every complete record on disk,
	/// in append order. A torn trailing line (crash mid-append) was never
	/// acknowledged; it is truncated away so the next append starts clean.
	pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<R>), StoreError> {
		let path = path.into();
		if let Some(dir) = path.parent() {
			fs::create_dir_all(dir)
				.map_err(|source| StoreError::Open { path: path.clone(), source })?;
		}

		let records = if path.exists() {
			let (records, valid_len) = Self::scan_file(&path)?;
			let on_disk = fs::metadata(&path)?.len();
			if valid_len < on_disk {
				tracing::warn!(
					"Truncating torn tail of {} ({on_disk} -> {valid_len} bytes)",
					path.display()
				);
				let file = OpenOptions::new().write(true).open(&path)?;
				file.set_len(valid_len)?;
				file.sync_data()?;
			}
			records
		} else {
			Vec::new()
		};

		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.map_err(|source| StoreError::Open { path: path.clone(), source })?;

		Ok((Self { path, file: Mutex::new(file), _record: PhantomData }, records))
	}

	/// Decodes every complete line; returns the records and the byte
	/// length of the complete prefix.
	fn scan_file(path: &Path) -> Result<(Vec<R>, u64), StoreError> {
		let contents = fs::read_to_string(path)?;

		let valid_len = match contents.rfind('\n') {
			Some(last_newline) => last_newline + 1,
			None => 0,
		};

		let mut records = Vec::new();
		for (index, line) in contents[..valid_len].lines().enumerate() {
			if line.is_empty() {
				continue
			}
			records.push(R::decode(line).map_err(|reason| StoreError::Corrupt {
				path: path.to_path_buf(),
				line: index + 1,
				reason,
			})?);
		}
		Ok((records, valid_len as u64))
	}

	/// Appends a record. Returns only once the bytes are fsynced; a
	/// returned error means the record must be treated as never written.
	pub fn append(&self, record: &R) -> Result<(), StoreError> {
		let mut file = self.file.lock().expect("append log lock poisoned");
		let mut line = record.encode();
		line.push('\n');
		file.write_all(line.as_bytes())?;
		file.sync_data()?;
		Ok(())
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Offline compaction: rewrites the file keeping only the records the
	/// predicate retains. Atomic via tmp file + fsync + rename; the log
	/// stays locked for the duration.
	pub fn compact(&self, retain: impl Fn(&R) -> bool) -> Result<(), StoreError> {
		let mut file = self.file.lock().expect("append log lock poisoned");

		let (records, _valid_len) = Self::scan_file(&self.path)?;
		let tmp_path = self.path.with_extension("compact-tmp");
		{
			let mut tmp = File::create(&tmp_path)?;
			for record in records.iter().filter(|record| retain(record)) {
				let mut line = record.encode();
				line.push('\n');
				tmp.write_all(line.as_bytes())?;
			}
			tmp.sync_all()?;
		}
		fs::rename(&tmp_path, &self.path)?;

		*file = OpenOptions::new().append(true).open(&self.path)?;
		Ok(())
	}
}

/// Splits a record line into its fields.
pub fn split_fields(line: &str) -> Vec<&str> {
	line.split(FIELD_SEPARATOR).collect()
}

pub fn parse_timestamp(field: &str) -> Result<DateTime<Utc>, String> {
	DateTime::parse_from_rfc3339(field)
		.map(|timestamp| timestamp.with_timezone(&Utc))
		.map_err(|error| format!("bad timestamp {field:?}: {error}"))
}

pub fn encode_timestamp(timestamp: DateTime<Utc>) -> String {
	// Nanosecond precision: journal round-trips must be lossless, both for
	// replay equality and for integrity hashes recomputed on re-offer.
	timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// One line of an audit trail:
/// `AUDIT | iso-timestamp | op | ballot-id | detail`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditRecord {
	pub at: DateTime<Utc>,
	pub op: String,
	pub ballot_id: Option<BallotId>,
	pub detail: String,
}

impl LogRecord for AuditRecord {
	fn encode(&self) -> String {
		[
			"AUDIT".to_string(),
			encode_timestamp(self.at),
			self.op.replace('|', "/"),
			self.ballot_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
			self.detail.replace('|', "/").replace('\n', " "),
		]
		.join(FIELD_SEPARATOR)
	}

	fn decode(line: &str) -> Result<Self, String> {
		let fields = split_fields(line);
		let [tag, at, op, ballot_id, detail] = fields.as_slice() else {
			return Err(format!("expected 5 audit fields, got {}", fields.len()))
		};
		if *tag != "AUDIT" {
			return Err(format!("bad audit tag {tag:?}"))
		}
		Ok(Self {
			at: parse_timestamp(at)?,
			op: op.to_string(),
			ballot_id: match *ballot_id {
				"-" => None,
				id => Some(id.parse().map_err(|error| format!("{error}"))?),
			},
			detail: detail.to_string(),
		})
	}
}

/// Append-only audit trail. Audit failures are reported but never abort
/// the operation being audited.
pub struct AuditLog {
	log: AppendLog<AuditRecord>,
}

impl AuditLog {
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let (log, _existing) = AppendLog::open(path)?;
		Ok(Self { log })
	}

	pub fn write(&self, op: &str, ballot_id: Option<BallotId>, detail: impl Into<String>) {
		let record = AuditRecord {
			at: Utc::now(),
			op: op.to_string(),
			ballot_id,
			detail: detail.into(),
		};
		if let Err(error) = self.log.append(&record) {
			tracing::warn!("Audit write failed for op {op}: {error}");
		}
	}

	pub fn path(&self) -> &Path {
		self.log.path()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Clone, Debug, PartialEq, Eq)]
	struct TestRecord {
		id: u32,
		note: String,
	}

	impl LogRecord for TestRecord {
		fn encode(&self) -> String {
			format!("{}{FIELD_SEPARATOR}{}", self.id, self.note)
		}

		fn decode(line: &str) -> Result<Self, String> {
			let fields = split_fields(line);
			let [id, note] = fields.as_slice() else {
				return Err(format!("expected 2 fields in {line:?}"))
			};
			Ok(Self {
				id: id.parse().map_err(|error| format!("{error}"))?,
				note: note.to_string(),
			})
		}
	}

	fn record(id: u32) -> TestRecord {
		TestRecord { id, note: format!("note-{id}") }
	}

	#[test]
	fn append_then_reopen_replays_records() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("test.log");

		let (log, existing) = AppendLog::<TestRecord>::open(&path).unwrap();
		assert!(existing.is_empty());
		log.append(&record(1)).unwrap();
		log.append(&record(2)).unwrap();
		drop(log);

		let (_log, existing) = AppendLog::<TestRecord>::open(&path).unwrap();
		assert_eq!(existing, vec![record(1), record(2)]);
	}

	#[test]
	fn torn_trailing_line_is_discarded() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("test.log");

		let (log, _) = AppendLog::<TestRecord>::open(&path).unwrap();
		log.append(&record(1)).unwrap();
		drop(log);

		// Simulate a crash mid-append: bytes present, no newline.
		let mut file = OpenOptions::new().append(true).open(&path).unwrap();
		file.write_all(b"2 | torn").unwrap();
		drop(file);

		let (log, existing) = AppendLog::<TestRecord>::open(&path).unwrap();
		assert_eq!(existing, vec![record(1)]);

		// The next append lands on its own line regardless.
		log.append(&record(3)).unwrap();
		drop(log);
		let (_log, existing) = AppendLog::<TestRecord>::open(&path).unwrap();
		assert_eq!(existing.last().unwrap().id, 3);
	}

	#[test]
	fn malformed_record_is_a_hard_error() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("test.log");
		fs::write(&path, "not a record at all\n").unwrap();

		assert!(matches!(
			AppendLog::<TestRecord>::open(&path),
			Err(StoreError::Corrupt { line: 1, .. })
		));
	}

	#[test]
	fn compaction_drops_filtered_records_atomically() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("test.log");

		let (log, _) = AppendLog::<TestRecord>::open(&path).unwrap();
		for id in 1..=10 {
			log.append(&record(id)).unwrap();
		}
		log.compact(|record| record.id % 2 == 0).unwrap();

		// Appends keep working on the compacted file.
		log.append(&record(11)).unwrap();
		drop(log);

		let (_log, existing) = AppendLog::<TestRecord>::open(&path).unwrap();
		assert_eq!(
			existing.iter().map(|record| record.id).collect::<Vec<_>>(),
			vec![2, 4, 6, 8, 10, 11]
		);
	}

	#[test]
	fn audit_record_round_trip() {
		let record = AuditRecord {
			at: Utc::now(),
			op: "enqueue".to_string(),
			ballot_id: Some(BallotId::from_bytes([1; 16])),
			detail: "priority NORMAL".to_string(),
		};
		let decoded = AuditRecord::decode(&record.encode()).unwrap();
		assert_eq!(decoded.op, record.op);
		assert_eq!(decoded.ballot_id, record.ballot_id);
		assert_eq!(decoded.detail, record.detail);
	}

	#[test]
	fn audit_detail_separator_is_sanitised() {
		let record = AuditRecord {
			at: Utc::now(),
			op: "quarantine".to_string(),
			ballot_id: None,
			detail: "err | with separator".to_string(),
		};
		let decoded = AuditRecord::decode(&record.encode()).unwrap();
		assert_eq!(decoded.detail, "err / with separator");
	}
}
