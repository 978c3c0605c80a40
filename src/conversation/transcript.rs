//! Conversation turns and the transcript log the orchestrator keeps.

use crate::error::Result;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

/// One user utterance and the response to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: u64,
    pub user_text: String,
    /// `None` when the response was interrupted before it was fully generated.
    pub response_text: Option<String>,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub interrupted: bool,
}

/// In-memory transcript, optionally mirrored to a JSON-lines file.
///
/// File appends happen on a writer thread so `record` never blocks on disk.
/// Dropping the log, or calling [`TranscriptLog::close`], waits for pending
/// appends to land.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    turns: Vec<ConversationTurn>,
    writer: Option<TranscriptWriter>,
}

#[derive(Debug)]
struct TranscriptWriter {
    tx: Sender<ConversationTurn>,
    thread: JoinHandle<()>,
}

impl TranscriptWriter {
    fn spawn(path: PathBuf, mut file: File) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<ConversationTurn>();
        let thread = thread::Builder::new()
            .name("parley-transcript".to_string())
            .spawn(move || {
                for turn in rx {
                    if let Err(e) = append_line(&mut file, &turn) {
                        tracing::warn!(
                            path = %path.display(),
                            turn_id = turn.id,
                            error = %e,
                            "failed to persist conversation turn"
                        );
                    }
                }
                tracing::debug!(path = %path.display(), "transcript writer finished");
            })?;
        Ok(Self { tx, thread })
    }

    fn finish(self) {
        drop(self.tx);
        if self.thread.join().is_err() {
            tracing::error!("transcript writer thread panicked");
        }
    }
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every recorded turn to `path`, creating it and its parent
    /// directories if needed.
    pub fn with_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            turns: Vec::new(),
            writer: Some(TranscriptWriter::spawn(path.to_path_buf(), file)?),
        })
    }

    /// Record a finished turn. Persistence failures are logged, not returned.
    pub fn record(&mut self, turn: ConversationTurn) {
        if let Some(writer) = &self.writer
            && writer.tx.send(turn.clone()).is_err()
        {
            tracing::warn!(turn_id = turn.id, "transcript writer is gone, turn not persisted");
        }
        self.turns.push(turn);
    }

    /// Wait for pending appends and stop mirroring to the file.
    pub fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.finish();
        }
    }

    /// The last `count` turns, oldest first.
    pub fn recent(&self, count: usize) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(count);
        &self.turns[start..]
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Close the file mirror and hand back the in-memory turns.
    pub fn into_turns(mut self) -> Vec<ConversationTurn> {
        self.close();
        std::mem::take(&mut self.turns)
    }
}

impl Drop for TranscriptLog {
    fn drop(&mut self) {
        self.close();
    }
}

fn append_line(file: &mut File, turn: &ConversationTurn) -> Result<()> {
    let line = serde_json::to_string(turn)?;
    writeln!(file, "{}", line)?;
    file.flush()?;
    Ok(())
}

/// Read a JSON-lines transcript written by [`TranscriptLog`]. Blank lines are skipped.
pub fn read_transcript(path: &Path) -> Result<Vec<ConversationTurn>> {
    let reader = BufReader::new(File::open(path)?);
    let mut turns = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        turns.push(serde_json::from_str(&line)?);
    }
    Ok(turns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn turn(id: u64, user: &str, response: Option<&str>) -> ConversationTurn {
        let started_at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + id);
        ConversationTurn {
            id,
            user_text: user.to_string(),
            response_text: response.map(str::to_string),
            started_at,
            ended_at: started_at + Duration::from_millis(1500),
            interrupted: response.is_none(),
        }
    }

    #[test]
    fn test_recent_returns_tail_oldest_first() {
        let mut log = TranscriptLog::new();
        for id in 0..5 {
            log.record(turn(id, "hi", Some("hello")));
        }

        let ids: Vec<u64> = log.recent(3).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(log.recent(10).len(), 5);
        assert!(log.recent(0).is_empty());
    }

    #[test]
    fn test_empty_log() {
        let log = TranscriptLog::new();
        assert!(log.is_empty());
        assert!(log.recent(4).is_empty());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("turns.jsonl");

        let mut log = TranscriptLog::with_file(&path).unwrap();
        log.record(turn(1, "what time is it", Some("It is noon.")));
        log.record(turn(2, "and the weather", None));
        assert_eq!(log.len(), 2);

        let turns = log.into_turns();
        let persisted = read_transcript(&path).unwrap();
        assert_eq!(persisted, turns);
    }

    #[test]
    fn test_record_does_not_wait_for_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("turns.jsonl");
        let mut log = TranscriptLog::with_file(&path).unwrap();

        for id in 0..200 {
            log.record(turn(id, "again", Some("Sure.")));
        }
        // Context reads see every turn straight away, whatever the writer's progress.
        assert_eq!(log.recent(1)[0].id, 199);

        log.close();
        assert_eq!(read_transcript(&path).unwrap().len(), 200);

        // After close, turns stay in memory only.
        log.record(turn(200, "late", Some("Ok.")));
        assert_eq!(log.len(), 201);
        assert_eq!(read_transcript(&path).unwrap().len(), 200);
    }

    #[test]
    fn test_file_appends_across_sessions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("turns.jsonl");

        TranscriptLog::with_file(&path)
            .unwrap()
            .record(turn(1, "a", Some("b")));
        TranscriptLog::with_file(&path)
            .unwrap()
            .record(turn(2, "c", Some("d")));

        let ids: Vec<u64> = read_transcript(&path)
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_interrupted_turn_serializes_without_response() {
        let json = serde_json::to_string(&turn(3, "stop", None)).unwrap();
        assert!(json.contains("\"response_text\":null"));
        assert!(json.contains("\"interrupted\":true"));
    }
}
