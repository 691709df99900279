//! Transcript file names.
//!
//! The live transcript is `<stem>.log`. A full transcript is renamed to
//! `<stem>.<YYYYMMDD-HHMM>.log`, with `-1`, `-2`, ... appended when an
//! earlier rotation in the same minute already took that name.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Transcript file stem for a server on `port`.
pub fn transcript_stem(port: u16) -> String {
	format!("nakime-{}", port)
}

pub fn current_log_name(stem: &str) -> String {
	format!("{}.log", stem)
}

/// First unused rotation target in `log_dir` for a rotation at `secs`.
pub fn rotated_log_path(log_dir: &Path, stem: &str, secs: u64) -> PathBuf {
	let stamp = timestamp(secs);
	let plain = log_dir.join(format!("{}.{}.log", stem, stamp));
	if !plain.exists() {
		return plain;
	}
	(1u32..)
		.map(|n| log_dir.join(format!("{}.{}-{}.log", stem, stamp, n)))
		.find(|candidate| !candidate.exists())
		.unwrap_or(plain)
}

/// UTC `YYYYMMDD-HHMM` for seconds since the epoch.
pub fn timestamp(secs: u64) -> String {
	let (year, month, day) = civil_from_days((secs / 86_400) as i64);
	let minute_of_day = (secs % 86_400) / 60;
	format!(
		"{:04}{:02}{:02}-{:02}{:02}",
		year,
		month,
		day,
		minute_of_day / 60,
		minute_of_day % 60
	)
}

pub(crate) fn now_secs() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

// Days since 1970-01-01 to a proleptic Gregorian (year, month, day), with
// years counted from March so leap days fall at the end.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
	let shifted = days + 719_468;
	let era = shifted.div_euclid(146_097);
	let day_of_era = shifted.rem_euclid(146_097);
	let year_of_era =
		(day_of_era - day_of_era / 1_460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
	let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
	let march_month = (5 * day_of_year + 2) / 153;
	let day = (day_of_year - (153 * march_month + 2) / 5 + 1) as u32;
	let month = (if march_month < 10 { march_month + 3 } else { march_month - 9 }) as u32;
	let year = year_of_era + era * 400 + i64::from(month <= 2);
	(year, month, day)
}
