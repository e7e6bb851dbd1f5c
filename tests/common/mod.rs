#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use mboxdex::core::config::Config;
use mboxdex::index::extractor::MboxHeaderExtractor;
use mboxdex::index::offset_index::{OffsetIndex, OffsetIndexBuilder};

/// One mbox message. Ids are only used to make content unique.
pub fn message(i: usize, thread: Option<&str>, domain: &str) -> String {
    let mut msg = format!(
        "From sender{i}@{domain} Mon Jan  1 00:00:00 2024\n\
         From: Sender {i} <sender{i}@{domain}>\n\
         Subject: Message {i}\n\
         Date: Mon, 1 Jan 2024 00:{minute:02}:00 +0000\n\
         Message-ID: <msg{i}@{domain}>\n",
        i = i,
        domain = domain,
        minute = i % 60,
    );
    if let Some(thread) = thread {
        msg.push_str(&format!("X-GM-THRID: {}\n", thread));
    }
    msg.push_str(&format!("\nBody of message {}.\n>From the archive, quoted.\n\n", i));
    msg
}

pub fn write_archive(dir: &Path, messages: &[String]) -> PathBuf {
    let path = dir.join("archive.mbox");
    fs::write(&path, messages.concat()).unwrap();
    path
}

/// `n` ungrouped messages from `example.com`.
pub fn simple_messages(n: usize) -> Vec<String> {
    (0..n).map(|i| message(i, None, "example.com")).collect()
}

/// Messages for each `(thread, count)`, interleaved round-robin so thread
/// members are not adjacent in the archive.
pub fn threaded_messages(threads: &[(&str, usize)]) -> Vec<String> {
    let mut left: Vec<(&str, usize)> = threads.to_vec();
    let mut messages: Vec<String> = Vec::new();
    while left.iter().any(|(_, n)| *n > 0) {
        for (thread, n) in left.iter_mut() {
            if *n > 0 {
                let domain = if messages.len() % 2 == 0 { "even.org" } else { "odd.org" };
                messages.push(message(messages.len(), Some(*thread), domain));
                *n -= 1;
            }
        }
    }
    messages
}

pub fn index_path(dir: &Path) -> PathBuf {
    dir.join("archive.idx")
}

pub fn builder(archive: &Path, dir: &Path) -> OffsetIndexBuilder {
    OffsetIndexBuilder::new(archive, index_path(dir)).with_extractor(Arc::new(MboxHeaderExtractor::new()))
}

pub fn build_index(archive: &Path, dir: &Path) -> OffsetIndex {
    builder(archive, dir).open_or_build(false, false).unwrap()
}

pub fn test_config(archive: &Path, output: &Path, workers: usize) -> Config {
    let mut config = Config::new(archive, output);
    config.workers = workers;
    config.show_progress = false;
    config.sink_retry_backoff_ms = 1;
    config
}
