use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use tail_events::{ChannelKey, RecordShape};

use crate::SessionError;

const TARGET_PLACEHOLDER: &str = "{target}";
const MAX_TARGET_BYTES: usize = 128;

/// The worker's identifying parameter (e.g. an account username).
///
/// It is written to the worker's stdin and substituted into output file names, so it must be
/// a single file-name component.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetName(String);

impl TargetName {
    pub fn new(raw: &str) -> Result<Self, SessionError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SessionError::EmptyTarget);
        }
        let unsafe_component = trimmed.len() > MAX_TARGET_BYTES
            || trimmed == "."
            || trimmed == ".."
            || trimmed
                .chars()
                .any(|ch| matches!(ch, '/' | '\\') || ch.is_control());
        if unsafe_component {
            return Err(SessionError::InvalidTarget(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One monitored output file: a channel key plus a file-name pattern.
///
/// `{target}` in the pattern is replaced by the session's [`TargetName`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelSpec {
    pub key: ChannelKey,
    pub file_pattern: String,
}

impl ChannelSpec {
    pub fn new(key: &str, file_pattern: impl Into<String>) -> Result<Self, SessionError> {
        let key =
            ChannelKey::new(key).ok_or_else(|| SessionError::InvalidChannelKey(key.to_string()))?;
        let file_pattern = file_pattern.into();
        if file_pattern.trim().is_empty() {
            return Err(SessionError::EmptyFilePattern(key.to_string()));
        }
        Ok(Self { key, file_pattern })
    }

    pub fn file_name(&self, target: &TargetName) -> String {
        self.file_pattern.replace(TARGET_PLACEHOLDER, target.as_str())
    }
}

/// The output files the scraper worker writes for a target.
pub fn default_channels() -> Vec<ChannelSpec> {
    [
        ("postid", "{target}_postid.txt"),
        ("mediaIds", "{target}_media_ids.txt"),
        ("comments", "{target}_comments.json"),
        ("likes", "{target}_likers.txt"),
        ("followers", "{target}_followers.txt"),
        ("leads", "{target}_leads.txt"),
        ("leadsData", "{target}_leads_data.json"),
        ("leadsRanked", "{target}_leads_ranked.json"),
    ]
    .into_iter()
    .map(|(key, file_pattern)| ChannelSpec {
        key: ChannelKey::new(key).unwrap_or_else(|| unreachable!("static channel key {key}")),
        file_pattern: file_pattern.to_string(),
    })
    .collect()
}

pub(crate) fn ensure_unique(channels: &[ChannelSpec]) -> Result<(), SessionError> {
    let mut seen = BTreeSet::new();
    for channel in channels {
        if !seen.insert(&channel.key) {
            return Err(SessionError::DuplicateChannel(channel.key.to_string()));
        }
    }
    Ok(())
}

/// A channel resolved against a target and output directory.
#[derive(Clone, Debug)]
pub(crate) struct WatchedChannel {
    pub(crate) key: ChannelKey,
    pub(crate) path: PathBuf,
    pub(crate) shape: RecordShape,
}

pub(crate) fn resolve(
    channels: &[ChannelSpec],
    target: &TargetName,
    output_dir: &Path,
) -> Vec<WatchedChannel> {
    channels
        .iter()
        .map(|channel| {
            let path = output_dir.join(channel.file_name(target));
            WatchedChannel {
                key: channel.key.clone(),
                shape: RecordShape::from_path(&path),
                path,
            }
        })
        .collect()
}
