use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::Location;
use std::path::Path;

use crate::errors::{MemtuneError, Result};

/// Frames never attributed as allocation sites
const INTERNAL_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "<std::",
    "<core::",
    "<alloc::",
    "backtrace::",
    "test::",
    "memtune::profiler",
    "<memtune::profiler",
    "__rust",
    "rust_begin_unwind",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    pub file: String,
    pub line: u32,
    pub function: Option<String>,
}

/// Ordered frames leading to an allocation, innermost first
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    pub frames: Vec<Frame>,
}

impl CallSite {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    /// A single-frame call site
    pub fn at(file: &str, line: u32, function: Option<&str>) -> Self {
        Self::new(vec![Frame {
            file: file.to_string(),
            line,
            function: function.map(str::to_string),
        }])
    }

    /// Single frame at `location`, without walking the stack
    pub fn from_location(location: &'static Location<'static>) -> Self {
        Self::new(vec![Frame {
            file: location.file().to_string(),
            line: location.line(),
            function: None,
        }])
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// SHA-256 of the frames, used to group allocations by site
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for frame in &self.frames {
            hasher.update(frame.file.as_bytes());
            hasher.update(b":");
            hasher.update(frame.line.to_string().as_bytes());
            hasher.update(b":");
            hasher.update(frame.function.as_deref().unwrap_or("").as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for CallSite {
    /// `file.rs:line function` of the innermost frame
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(frame) = self.frames.first() else {
            return f.write_str("unknown");
        };
        let file = Path::new(&frame.file)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| frame.file.clone());
        write!(f, "{}:{}", file, frame.line)?;
        if let Some(function) = &frame.function {
            write!(f, " {}", function)?;
        }
        Ok(())
    }
}

/// Turns a captured backtrace into a bounded [`CallSite`].
///
/// The caller's exact location always comes from `#[track_caller]`; the
/// backtrace only contributes function names and outer frames, so builds
/// without symbols still get a usable single-frame site.
pub struct CallSiteCapture {
    depth: usize,
    function_line: Regex,
    location_line: Regex,
    hash_suffix: Regex,
}

impl CallSiteCapture {
    pub fn new(depth: usize) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| MemtuneError::configuration(format!("Backtrace pattern: {}", e)))
        };
        Ok(Self {
            depth,
            function_line: compile(r"^\s*\d+:\s+(.+?)\s*$")?,
            location_line: compile(r"^\s+at\s+(.+):(\d+):\d+\s*$")?,
            hash_suffix: compile(r"::h[0-9a-f]{16}$")?,
        })
    }

    pub fn capture(&self, caller: &'static Location<'static>) -> CallSite {
        let trace = Backtrace::force_capture().to_string();
        let outer = self.parse(&trace);
        self.assemble(caller, outer)
    }

    fn assemble(&self, caller: &'static Location<'static>, outer: Vec<Frame>) -> CallSite {
        let mut outer = outer.into_iter();
        let mut frames = vec![Frame {
            file: caller.file().to_string(),
            line: caller.line(),
            function: outer.next().and_then(|frame| frame.function),
        }];
        frames.extend(outer.take(self.depth.saturating_sub(1)));
        CallSite::new(frames)
    }

    /// Application frames of a rendered backtrace, innermost first
    fn parse(&self, trace: &str) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut pending: Option<String> = None;

        for line in trace.lines() {
            if let Some(caps) = self.location_line.captures(line) {
                if let Some(function) = pending.take() {
                    frames.push(Frame {
                        file: caps[1].to_string(),
                        line: caps[2].parse().unwrap_or(0),
                        function: Some(function),
                    });
                }
            } else if let Some(caps) = self.function_line.captures(line) {
                if let Some(function) = pending.take() {
                    frames.push(Frame {
                        file: "unknown".to_string(),
                        line: 0,
                        function: Some(function),
                    });
                }
                pending = Some(self.hash_suffix.replace(&caps[1], "").into_owned());
            }
        }
        if let Some(function) = pending {
            frames.push(Frame {
                file: "unknown".to_string(),
                line: 0,
                function: Some(function),
            });
        }

        frames.retain(|frame| !is_internal(frame.function.as_deref().unwrap_or("")));
        frames
    }
}

fn is_internal(function: &str) -> bool {
    function.is_empty()
        || function == "<unknown>"
        || function.contains("core::ops::function")
        || INTERNAL_PREFIXES.iter().any(|prefix| function.starts_with(prefix))
}
