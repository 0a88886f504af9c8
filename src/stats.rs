//! Session accounting.
//!
//! Counters are kept for the whole run and written as a single
//! `<session .../>` line when the proxy exits. Writing the record is best
//! effort; a failure is logged and otherwise ignored.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::time::TimeVal;
use tracing::{debug, warn};

/// Value of the record's `server` attribute.
const SERVER_NAME: &str = "molproxy";

#[derive(Debug)]
pub struct SessionStats {
    started_at: DateTime<Local>,
    started: Instant,
    frames: u64,
    frame_bytes: u64,
    commands: u64,
    cmd_time: Duration,
    client_info: Vec<(String, String)>,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started_at: Local::now(),
            started: Instant::now(),
            frames: 0,
            frame_bytes: 0,
            commands: 0,
            cmd_time: Duration::ZERO,
            client_info: Vec::new(),
        }
    }

    pub fn record_command(&mut self, elapsed: Duration) {
        self.commands += 1;
        self.cmd_time += elapsed;
    }

    /// Count a frame fully written to the client.
    pub fn record_frame(&mut self, payload_len: usize) {
        self.frames += 1;
        self.frame_bytes += payload_len as u64;
    }

    /// Remember a `clientinfo` pair. A repeated key keeps its latest value.
    pub fn add_client_info(&mut self, key: &str, value: &str) {
        let Some(key) = attribute_name(key) else {
            debug!("Ignoring client info key {:?}", key);
            return;
        };
        match self.client_info.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.client_info.push((key, value.to_string())),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn frame_bytes(&self) -> u64 {
        self.frame_bytes
    }

    pub fn commands(&self) -> u64 {
        self.commands
    }

    /// Format the end-of-session record.
    pub fn record(&self, status: i32) -> String {
        let mut attrs: Vec<(String, String)> = vec![
            ("server".into(), SERVER_NAME.into()),
            ("date".into(), self.started_at.format("%a %b %e %H:%M:%S %Y").to_string()),
            ("date_secs".into(), self.started_at.timestamp().to_string()),
            ("pid".into(), std::process::id().to_string()),
            ("num_frames".into(), self.frames.to_string()),
            ("frame_bytes".into(), self.frame_bytes.to_string()),
            ("num_commands".into(), self.commands.to_string()),
            ("cmd_time".into(), seconds(self.cmd_time)),
            ("session_time".into(), seconds(self.started.elapsed())),
            ("status".into(), status.to_string()),
        ];
        attrs.extend(cpu_times());
        attrs.extend(self.client_info.iter().cloned());

        let mut line = String::from("<session");
        for (key, value) in &attrs {
            line.push_str(&format!(" {}=\"{}\"", key, escape(value)));
        }
        line.push_str("/>\n");
        line
    }

    /// Append the record to `path`, creating its directory if needed.
    pub fn append_to(&self, path: &Path, status: i32) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(self.record(status).as_bytes())
    }

    /// [`append_to`](Self::append_to), logging instead of failing.
    pub fn save(&self, path: &Path, status: i32) {
        match self.append_to(path, status) {
            Ok(()) => debug!("Session record written to {}", path.display()),
            Err(e) => warn!("Failed to write session record to {}: {}", path.display(), e),
        }
    }
}

fn seconds(duration: Duration) -> String {
    format!("{:.6}", duration.as_secs_f64())
}

fn timeval_seconds(tv: TimeVal) -> String {
    format!("{:.6}", tv.tv_sec() as f64 + tv.tv_usec() as f64 / 1e6)
}

/// utime, stime, cutime and cstime; omitted when unavailable.
fn cpu_times() -> Vec<(String, String)> {
    let mut times = Vec::new();
    for (who, user, system) in [
        (UsageWho::RUSAGE_SELF, "utime", "stime"),
        (UsageWho::RUSAGE_CHILDREN, "cutime", "cstime"),
    ] {
        match getrusage(who) {
            Ok(usage) => {
                times.push((user.to_string(), timeval_seconds(usage.user_time())));
                times.push((system.to_string(), timeval_seconds(usage.system_time())));
            }
            Err(e) => debug!("getrusage failed: {}", e),
        }
    }
    times
}

/// Client keys become attribute names; anything unusual is replaced.
fn attribute_name(key: &str) -> Option<String> {
    let name: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    match name.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => Some(name),
        _ => None,
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#10;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute<'a>(record: &'a str, name: &str) -> Option<&'a str> {
        let start = record.find(&format!(" {}=\"", name))? + name.len() + 3;
        let len = record[start..].find('"')?;
        Some(&record[start..start + len])
    }

    #[test]
    fn test_counters() {
        let mut stats = SessionStats::new();
        stats.record_command(Duration::from_millis(5));
        stats.record_command(Duration::from_millis(7));
        stats.record_frame(100);
        stats.record_frame(50);

        assert_eq!(stats.commands(), 2);
        assert_eq!(stats.frames(), 2);
        assert_eq!(stats.frame_bytes(), 150);

        let record = stats.record(0);
        assert_eq!(attribute(&record, "num_commands"), Some("2"));
        assert_eq!(attribute(&record, "frame_bytes"), Some("150"));
        assert_eq!(attribute(&record, "cmd_time"), Some("0.012000"));
    }

    #[test]
    fn test_record_shape() {
        let stats = SessionStats::new();
        let record = stats.record(3);

        assert!(record.starts_with("<session server=\"molproxy\""));
        assert!(record.ends_with("/>\n"));
        assert_eq!(attribute(&record, "status"), Some("3"));
        assert_eq!(attribute(&record, "pid"), Some(std::process::id().to_string().as_str()));
        for name in ["date", "date_secs", "session_time", "utime", "stime", "cutime", "cstime"] {
            assert!(attribute(&record, name).is_some(), "{}", name);
        }
    }

    #[test]
    fn test_client_info_is_escaped() {
        let mut stats = SessionStats::new();
        stats.add_client_info("user", "a<b>&\"c\"");
        stats.add_client_info("user", "joe");
        stats.add_client_info("tool id", "x");
        stats.add_client_info("9lives", "dropped");

        let record = stats.record(0);
        assert_eq!(attribute(&record, "user"), Some("joe"));
        assert_eq!(attribute(&record, "tool_id"), Some("x"));
        assert!(!record.contains("9lives"));

        stats.add_client_info("note", "a<b>&\"c\"");
        let record = stats.record(0);
        assert_eq!(attribute(&record, "note"), Some("a&lt;b&gt;&amp;&quot;c&quot;"));
    }

    #[test]
    fn test_append_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visservers").join("data.xml");
        let stats = SessionStats::new();

        stats.append_to(&path, 0).unwrap();
        stats.append_to(&path, 1).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().all(|l| l.starts_with("<session ")));
    }
}
