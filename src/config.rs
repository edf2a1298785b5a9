//! Session config files.
//!
//! ```text
//! # capture the second X display
//! display_number=1
//! origin=0,0
//! video_format=1280x720, 30
//! video_format=640x480, 15
//! ```
//!
//! Each `video_format` line adds one branch, in file order. Lines that do not
//! parse are skipped and reported as [`ConfigDiagnostic`]s; only a file with
//! no usable profile at all is an error.

use crate::error::{Error, Result};
use crate::profile::{CaptureTarget, MAX_BRANCHES, StreamProfile};
use std::fmt;
use std::path::Path;
use winnow::Parser;
use winnow::ascii::{digit1, space0};
use winnow::combinator::{eof, opt, terminated};
use winnow::error::ContextError;
use winnow::token::{one_of, take_while};

type WResult<T> = std::result::Result<T, ContextError>;

/// A config line that was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDiagnostic {
    /// 1-based line number.
    pub line: usize,
    /// What was wrong with it.
    pub message: String,
}

impl fmt::Display for ConfigDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Everything a session needs from its config file.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// What to capture.
    pub capture: CaptureTarget,
    /// Output profiles in file order.
    pub profiles: Vec<StreamProfile>,
    /// Lines that were skipped.
    pub diagnostics: Vec<ConfigDiagnostic>,
}

impl SessionConfig {
    /// Read and parse a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        tracing::debug!("loaded config {}", path.display());
        Self::parse(&text)
    }

    /// Parse config text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = SessionConfig {
            capture: CaptureTarget::default(),
            profiles: Vec::new(),
            diagnostics: Vec::new(),
        };

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }

            match classify(content) {
                Ok(Entry::Display(id)) => config.capture.display_id = id,
                Ok(Entry::Origin(x, y)) => {
                    config.capture.origin_x = x;
                    config.capture.origin_y = y;
                }
                Ok(Entry::Format {
                    width,
                    height,
                    framerate,
                }) => {
                    if config.profiles.len() == MAX_BRANCHES {
                        config.skip(line, format!("more than {MAX_BRANCHES} video formats"));
                        continue;
                    }
                    match StreamProfile::new(width, height, framerate) {
                        Ok(profile) => config.profiles.push(profile),
                        Err(e) => config.skip(line, e.to_string()),
                    }
                }
                Err(message) => config.skip(line, message),
            }
        }

        if config.profiles.is_empty() {
            return Err(Error::Config("no usable video_format line".into()));
        }
        Ok(config)
    }

    fn skip(&mut self, line: usize, message: String) {
        tracing::warn!(line, "skipping config line: {}", message);
        self.diagnostics.push(ConfigDiagnostic { line, message });
    }
}

#[derive(Debug, PartialEq)]
enum Entry {
    Display(i32),
    Origin(i32, i32),
    Format {
        width: u32,
        height: u32,
        framerate: u32,
    },
}

fn classify(content: &str) -> std::result::Result<Entry, String> {
    let mut input = content;
    let key = terminated(key, (space0, '=', space0))
        .parse_next(&mut input)
        .map_err(|_| format!("expected `key=value`, found `{content}`"))?;

    let value = input;
    let parsed = match key {
        "display_number" => terminated(signed, (space0, eof))
            .map(Entry::Display)
            .parse_next(&mut input),
        "origin" => terminated(origin, (space0, eof)).parse_next(&mut input),
        "video_format" => terminated(video_format, (space0, eof)).parse_next(&mut input),
        other => return Err(format!("unknown key `{other}`")),
    };
    parsed.map_err(|_| format!("malformed {key} value `{value}`"))
}

fn key<'a>(input: &mut &'a str) -> WResult<&'a str> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_').parse_next(input)
}

fn unsigned(input: &mut &str) -> WResult<u32> {
    digit1.try_map(str::parse::<u32>).parse_next(input)
}

fn signed(input: &mut &str) -> WResult<i32> {
    (opt('-'), digit1)
        .take()
        .try_map(str::parse::<i32>)
        .parse_next(input)
}

/// `<W>x<H>, <fps>`
fn video_format(input: &mut &str) -> WResult<Entry> {
    let width = unsigned.parse_next(input)?;
    let _ = (space0, one_of(['x', 'X']), space0).parse_next(input)?;
    let height = unsigned.parse_next(input)?;
    let _ = (space0, ',', space0).parse_next(input)?;
    let framerate = unsigned.parse_next(input)?;
    Ok(Entry::Format {
        width,
        height,
        framerate,
    })
}

/// `<x>,<y>`
fn origin(input: &mut &str) -> WResult<Entry> {
    let x = signed.parse_next(input)?;
    let _ = (space0, ',', space0).parse_next(input)?;
    let y = signed.parse_next(input)?;
    Ok(Entry::Origin(x, y))
}
