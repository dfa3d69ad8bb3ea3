use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
};

use clap::ValueEnum;

/// Resolution tags accepted on the command line, paired with their scale filters.
pub const RESOLUTION_FILTERS: [(&str, &str); 3] = [
    ("1080p", "scale=-2:1080"),
    ("720p", "scale=-2:720"),
    ("480p", "scale=-2:480"),
];

/// Extensions of MPEG transport stream containers. Their reported bitrate includes a lot of
/// muxing overhead, so they get a much larger bitrate divisor.
const TRANSPORT_STREAM_EXTENSIONS: [&str; 3] = ["ts", "m2ts", "mts"];

/// Reference mode used when a tier name is not recognized.
pub const FALLBACK_REF_MODE: RefMode = RefMode::Middle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Quality {
    Low,
    Middle,
    High,
    Super,
}

impl Quality {
    /// Parse a tier name, ignoring case. Unknown names give `None`.
    pub fn from_name(name: &str) -> Option<Quality> {
        <Quality as ValueEnum>::from_str(name.trim(), true).ok()
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quality::Low => "low",
            Quality::Middle => "middle",
            Quality::High => "high",
            Quality::Super => "super",
        };
        f.write_str(name)
    }
}

/// The encoder's `-b_ref_mode`: whether B-frames may be used as references.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefMode {
    Disabled,
    Middle,
    Each,
}

impl RefMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefMode::Disabled => "disabled",
            RefMode::Middle => "middle",
            RefMode::Each => "each",
        }
    }
}

impl fmt::Display for RefMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the source bitrate is divided by to get the target bitrate.
///
/// `None` stands for a tier name that could not be parsed.
pub fn bitrate_divisor(quality: Option<Quality>, transport_stream: bool) -> f64 {
    let base = if transport_stream { 20.0 } else { 2.0 };
    match quality {
        Some(Quality::Low) => base * 10.0,
        Some(Quality::Middle) => base * 5.0,
        Some(Quality::High) => base * 2.5,
        // super ignores the container
        Some(Quality::Super) | None => 2.0,
    }
}

pub fn ref_mode(quality: Option<Quality>) -> RefMode {
    match quality {
        Some(Quality::Low) => RefMode::Disabled,
        Some(Quality::Middle) => RefMode::Middle,
        Some(Quality::High) | Some(Quality::Super) => RefMode::Each,
        None => FALLBACK_REF_MODE,
    }
}

/// Returns the target bitrate in kb/s and the reference mode for a source of `source_kbps`.
pub fn derive(source_kbps: u64, quality: Option<Quality>, transport_stream: bool) -> (f64, RefMode) {
    (
        source_kbps as f64 / bitrate_divisor(quality, transport_stream),
        ref_mode(quality),
    )
}

/// Map a resolution tag like "720p" to an ffmpeg scale filter. Unknown tags mean no scaling.
pub fn select_filter(tag: Option<&str>) -> Option<&'static str> {
    let tag = tag?;
    RESOLUTION_FILTERS
        .iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, filter)| *filter)
}

pub fn is_transport_stream(path: &Path) -> bool {
    path.extension()
        .map(|extension| extension.to_ascii_lowercase())
        .map_or(false, |extension| {
            TRANSPORT_STREAM_EXTENSIONS
                .iter()
                .any(|ts| extension == *ts)
        })
}

/// One input file's encoding task, created once its source bitrate is known.
#[derive(Clone, Debug)]
pub struct Job {
    pub input: PathBuf,
    pub output: PathBuf,
    pub source_kbps: u64,
    pub quality: Option<Quality>,
    pub resolution: Option<String>,
    pub codec: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EncodingPlan {
    pub target_kbps: f64,
    pub ref_mode: RefMode,
    pub filter: Option<&'static str>,
}

impl EncodingPlan {
    /// The value passed to `-b:v`. Fractions are kept: "1.5k" is a valid ffmpeg bitrate.
    pub fn bitrate_arg(&self) -> String {
        format!("{}k", self.target_kbps)
    }

    /// True when there is no positive bitrate to ask for, which happens when the source
    /// bitrate could not be probed.
    pub fn is_degenerate(&self) -> bool {
        self.target_kbps.is_nan() || self.target_kbps <= 0.0
    }
}

impl Job {
    pub fn is_transport_stream(&self) -> bool {
        is_transport_stream(&self.input)
    }

    pub fn plan(&self) -> EncodingPlan {
        let (target_kbps, ref_mode) =
            derive(self.source_kbps, self.quality, self.is_transport_stream());
        EncodingPlan {
            target_kbps,
            ref_mode,
            filter: select_filter(self.resolution.as_deref()),
        }
    }

    /// Arguments for the encode invocation. `extra` goes right before the output path.
    pub fn ffmpeg_args(&self, plan: &EncodingPlan, extra: &[OsString]) -> Vec<OsString> {
        let mut args = os_args![
            "-i",
            &self.input,
            "-c:v",
            &self.codec,
            "-b:v",
            plan.bitrate_arg(),
            "-b_ref_mode",
            plan.ref_mode.as_str(),
        ];
        args.extend(os_args!(str: "-f mp4 -tag:v hvc1 -y"));
        if let Some(filter) = plan.filter {
            args.extend(os_args!["-vf", filter]);
        }
        args.extend(extra.iter().cloned());
        args.push(self.output.clone().into_os_string());
        args
    }
}
