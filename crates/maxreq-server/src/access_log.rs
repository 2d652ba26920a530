//! Combined Log Format access log.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One served request.
#[derive(Debug, Clone)]
pub struct AccessEntry<'a> {
    pub host: String,
    pub time: DateTime<Utc>,
    /// Request line as received, e.g. `GET / HTTP/1.1`.
    pub request_line: &'a str,
    pub status: u16,
    /// Response body size.
    pub bytes: usize,
    pub referer: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Render `entry` as a Combined Log Format line, without the trailing newline.
pub fn format_line(entry: &AccessEntry<'_>) -> String {
    let bytes = if entry.bytes == 0 {
        "-".to_string()
    } else {
        entry.bytes.to_string()
    };
    format!(
        "{host} - - [{time}] \"{request}\" {status} {bytes} \"{referer}\" \"{agent}\"",
        host = entry.host,
        time = entry.time.format("%d/%b/%Y:%H:%M:%S %z"),
        request = escape(entry.request_line),
        status = entry.status,
        referer = escape(entry.referer.unwrap_or("-")),
        agent = escape(entry.user_agent.unwrap_or("-")),
    )
}

fn escape(field: &str) -> String {
    field.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Append-only access log file shared by every connection.
#[derive(Debug)]
pub struct AccessLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AccessLog {
    /// Open `path` for appending, creating it if needed.
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, entry: &AccessEntry<'_>) -> io::Result<()> {
        let mut line = format_line(entry);
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry() -> AccessEntry<'static> {
        AccessEntry {
            host: "127.0.0.1".to_string(),
            time: Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap(),
            request_line: "GET /index.html HTTP/1.1",
            status: 200,
            bytes: 1043,
            referer: None,
            user_agent: Some("curl/8.5.0"),
        }
    }

    #[test]
    fn test_combined_format() {
        assert_eq!(
            format_line(&entry()),
            r#"127.0.0.1 - - [05/Mar/2024:14:07:09 +0000] "GET /index.html HTTP/1.1" 200 1043 "-" "curl/8.5.0""#
        );
    }

    #[test]
    fn test_empty_body_and_quotes() {
        let line = format_line(&AccessEntry {
            bytes: 0,
            status: 400,
            request_line: "GET /\"x\" HTTP/1.1",
            user_agent: None,
            ..entry()
        });
        assert!(line.contains(r#""GET /\"x\" HTTP/1.1" 400 - "-" "-""#), "{line}");
    }

    #[tokio::test]
    async fn test_record_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "existing\n").unwrap();

        let log = AccessLog::open(&path).await.unwrap();
        log.record(&entry()).await.unwrap();
        log.record(&entry()).await.unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "existing");
        assert!(lines[2].starts_with("127.0.0.1 - - [05/Mar/2024"));
    }
}
