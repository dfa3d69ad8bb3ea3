use std::{
    cmp::max,
    env,
    ffi::OsString,
    io::{BufRead, ErrorKind, Write},
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{builder::PossibleValuesParser, ArgAction, Parser};
use globset::{Glob, GlobSet, GlobSetBuilder};
#[allow(unused_imports)]
use log::*;
use regex::Regex;
use tokio::{process::Command, select};
use tokio_util::sync::CancellationToken;

// Easily package different kinds of args as OsString
macro_rules! os_args {
    (str: $str:expr) => {
        $str.split_whitespace().map(|x| OsString::from(x)).collect::<Vec<_>>()
    };
    ($($x : expr),* $(,)?) => {
        vec![$(OsString::from($x)), *]
    };
}

pub mod input_file;
pub use input_file::*;
pub mod logger;
#[allow(unused_imports)]
pub use logger::*;
pub mod plan;
pub use plan::*;
pub mod pool;
pub use pool::*;
pub mod probe;
pub use probe::*;

pub const OUTPUT_DIR: &str = "output";
pub const DEFAULT_CODEC: &str = "hevc_nvenc";

/// Encoders that run on dedicated hardware. They are limited by encoder sessions, not CPU cores.
const HARDWARE_CODEC_SUFFIXES: [&str; 5] = ["_nvenc", "_qsv", "_vaapi", "_amf", "_videotoolbox"];
const DEFAULT_HARDWARE_JOBS: usize = 2;

#[derive(Parser, Debug)]
#[clap(
    version,
    about = "Re-encode every video in a directory, deriving the bitrate from the source"
)]
pub struct Args {
    /// Encode the videos in this directory. By default, encode in the current directory. Output
    /// files are put in "input_dir/output" unless `--output-dir` is given.
    #[clap(default_value = ".", hide_default_value = true)]
    pub input_dir: PathBuf,

    /// Output files will be saved in this directory. By default, it is <INPUT_DIR>/output.
    #[clap(long, short, aliases = ["output-directory", "output-path"])]
    pub output_dir: Option<PathBuf>,

    /// How much of the source bitrate to keep. "low" keeps a tenth of the usual amount, "super"
    /// keeps half of the source bitrate whatever the container.
    #[clap(long, short, value_enum, default_value_t = Quality::Middle)]
    pub quality: Quality,

    /// Scale the video to this height, keeping the aspect ratio. By default the source
    /// resolution is kept.
    #[clap(long, short, value_parser = PossibleValuesParser::new(RESOLUTION_FILTERS.map(|(tag, _)| tag)))]
    pub resolution: Option<String>,

    /// The ffmpeg video encoder.
    #[clap(long, short, default_value = DEFAULT_CODEC)]
    pub codec: String,

    /// Encode this many videos in parallel. The default is 2 for hardware encoders, and half
    /// the physical cores for software encoders.
    #[clap(long, short, alias = "max-jobs")]
    pub jobs: Option<usize>,

    /// Overwrite existing output files. Otherwise they are skipped.
    #[clap(long, short = 'w')]
    pub overwrite: bool,

    /// Delete each source file once it has been encoded successfully.
    #[clap(long, short)]
    pub delete: bool,

    /// Don't ask for confirmation before encoding.
    #[clap(long = "yes", short = 'y', alias = "assume-yes")]
    pub assume_yes: bool,

    /// Seconds between progress reports.
    #[clap(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub progress_interval: u64,

    /// Paths (usually glob patterns) that will not be encoded. They match from the input
    /// directory, for example "*trailer*". This argument must be given once per pattern.
    #[clap(long)]
    pub exclude: Vec<String>,

    /// Encode a certain number of files, then stop.
    #[clap(long)]
    pub limit: Option<usize>,

    /// Add additional ffmpeg flags, such as "-to 5:00" to quickly test the first few minutes of a
    /// file.  Each option should be passed separately, for example:
    /// `nvbatch --extra-flag='-ss 30' --extra-flag='-t 5:00'`
    #[clap(long, allow_hyphen_values(true))]
    pub extra_flag: Vec<String>,

    /// Don't write log files for each ffmpeg invocation. This avoids polluting your output
    /// directory with a log file per input.
    #[clap(long, short)]
    pub no_log: bool,

    /// Can specify --quiet --quiet to make the program ever more quiet.
    #[clap(long, action = ArgAction::Count)]
    pub quiet: u8,

    /// Increase the log verbosity.
    #[clap(long, short, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn get_verbosity(&self) -> i8 {
        self.verbose as i8 - self.quiet as i8
    }

    pub fn is_hardware_codec(&self) -> bool {
        HARDWARE_CODEC_SUFFIXES
            .iter()
            .any(|suffix| self.codec.ends_with(suffix))
    }

    /// How many jobs should run in parallel?
    pub fn get_jobs(&self) -> Result<usize> {
        let jobs = match self.jobs {
            Some(0) => {
                bail!("Cannot run with 0 jobs.");
            }
            None if self.is_hardware_codec() => DEFAULT_HARDWARE_JOBS,
            None => max(1, num_cpus::get_physical() / 2),
            Some(n) => n,
        };

        Ok(jobs)
    }

    pub fn get_extra_flags(&self) -> Result<Vec<String>> {
        let whitespace_re = Regex::new(r"\s+")?;
        Ok(self
            .extra_flag
            .iter()
            .flat_map(|extra_flag| {
                // Split once on space, or leave as is if there's no space:
                whitespace_re.splitn(extra_flag.trim(), 2).map(String::from)
            })
            .filter(|flag| !flag.is_empty())
            .collect())
    }
}

struct FoundExecutable {
    path: OsString,
    from_env: bool,
}

/// Runs a batch: discovers the inputs, and encodes each of them as a pool `Worker`.
pub struct Encoder {
    args: Arc<Args>,
    ffmpeg_path: OsString,
    ffmpeg_from_env: bool,
    exclude: GlobSet,
    cancel: CancellationToken,
}

impl Encoder {
    pub fn new(args: Args) -> Result<Encoder> {
        Self::build(args, find_executable())
    }

    /// Use this transcoder instead of looking at $FFMPEG and the PATH.
    pub fn with_transcoder(args: Args, ffmpeg: impl Into<OsString>) -> Result<Encoder> {
        Self::build(
            args,
            FoundExecutable {
                path: ffmpeg.into(),
                from_env: false,
            },
        )
    }

    fn build(args: Args, ffmpeg: FoundExecutable) -> Result<Encoder> {
        Ok(Encoder {
            exclude: Self::get_matcher_from_globs(&args.exclude)?,
            args: Arc::new(args),
            ffmpeg_path: ffmpeg.path,
            ffmpeg_from_env: ffmpeg.from_env,
            cancel: CancellationToken::new(),
        })
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    /// Fire this to stop starting jobs and kill the running encodes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn get_matcher_from_globs(patterns: &[String]) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Could not build glob pattern {pattern:?}"))?,
            );
        }
        Ok(builder.build()?)
    }

    /// Make sure the transcoder can be started at all, before anything is encoded.
    pub async fn check_transcoder(&self) -> Result<()> {
        let status = Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let hint = if self.ffmpeg_from_env {
                    "check the FFMPEG environment variable"
                } else {
                    "install it or set FFMPEG to its path"
                };
                bail!("Transcoder not found: {:?} ({hint})", self.ffmpeg_path)
            }
            Err(err) => Err(anyhow!(err).context(format!("Could not run {:?}", self.ffmpeg_path))),
        }
    }

    /// Get the paths of the videos directly in the input directory, in natural order.
    pub async fn get_video_paths(&self) -> Result<Vec<InputFile>> {
        let video_re = Regex::new(r"^(?:mp4|m4v|mov|mkv|ts|m2ts|mts)$")?;
        let input_dir = &self.args.input_dir;
        let output_dir = get_output_dir(&self.args);

        let mut entries = Vec::new();
        for entry in input_dir
            .read_dir()
            .with_context(|| format!("Could not list the input directory {input_dir:?}"))?
        {
            entries.push(entry?.path());
        }
        entries.sort_by(|p1, p2| {
            lexical_sort::natural_lexical_cmp(&p1.to_string_lossy(), &p2.to_string_lossy())
        });

        let mut videos = Vec::new();
        for fname in entries {
            if let Some(limit) = self.args.limit {
                if videos.len() == limit {
                    log::debug!("Reached video limit={limit}, won't encode any more");
                    break;
                }
            }
            if is_same_file(&fname, &output_dir) {
                continue;
            }
            let matchable_path = pathdiff::diff_paths(&fname, input_dir).unwrap_or(fname.clone());
            if self.exclude.is_match(&matchable_path) {
                log::debug!("Skipping path because of exclude: {fname:?}");
                continue;
            }
            // Follows symlinks, unlike DirEntry::metadata:
            if !fname.metadata().map_or(false, |md| md.is_file()) {
                continue;
            }
            if extension_matches(&fname, &video_re)? {
                videos.push(InputFile::new(&fname, self.args.clone())?);
            } else {
                log::trace!("Not a video: {fname:?}");
            }
        }

        Ok(videos)
    }

    /// Print the settings and the files that will be encoded.
    pub fn describe_batch<W: Write>(&self, inputs: &[InputFile], mut out: W) -> Result<()> {
        writeln!(out, "Output directory: {:?}", get_output_dir(&self.args))?;
        writeln!(out, "Quality: {}", self.args.quality)?;
        writeln!(
            out,
            "Resolution: {}",
            self.args.resolution.as_deref().unwrap_or("unchanged")
        )?;
        writeln!(out, "Codec: {}", self.args.codec)?;
        writeln!(out, "Delete source files: {}", self.args.delete)?;
        writeln!(out, "Input files:")?;
        for input in inputs {
            writeln!(out, "  {}", input.path.display())?;
        }
        Ok(())
    }

    pub fn create_output_dir(&self) -> Result<()> {
        let output_dir = get_output_dir(&self.args);
        if !output_dir.is_dir() {
            if output_dir.exists() {
                bail!("Cannot encode to {output_dir:?} because it exists but is not a directory.");
            }
            std::fs::create_dir_all(&output_dir)
                .with_context(|| format!("Could not create the output directory {output_dir:?}"))?;
        }
        Ok(())
    }

    pub async fn encode_videos(&self, inputs: &[InputFile]) -> Result<BatchSummary> {
        let jobs = self.args.get_jobs()?;
        info!("Encoding {} videos, at most {jobs} at a time", inputs.len());

        let pool = Pool::new(jobs, inputs.len(), self.cancel.clone())?
            .delete_sources(self.args.delete)
            .progress_interval(Duration::from_secs(self.args.progress_interval));
        let summary = pool.run(inputs, self).await?;

        if summary.failed() > 0 {
            log::warn!("Failure summary:");
            for (path, msg) in summary.failures() {
                log::warn!("{}: {}", path.to_string_lossy(), msg);
            }
        }
        Ok(summary)
    }

    fn get_extra_args(&self, input: &InputFile) -> Result<Vec<OsString>> {
        let mut extra: Vec<OsString> = self
            .args
            .get_extra_flags()?
            .into_iter()
            .map(OsString::from)
            .collect();

        // Add other args specific to this filename
        if let Some(env_ffmpeg_args) = input.env_ffmpeg_args()? {
            extra.extend(os_args!(str: env_ffmpeg_args));
        }

        match env::var("FFMPEG_FLAGS") {
            Ok(env_args) => {
                extra.extend(os_args!(str: env_args));
            }
            Err(env::VarError::NotPresent) => {}
            Err(err) => {
                job_warn!(
                    input,
                    "Could not get extra ffmpeg args from FFMPEG_FLAGS: {err}"
                );
            }
        }
        Ok(extra)
    }
}

impl Worker for Encoder {
    async fn process(&self, input: &InputFile) -> Result<()> {
        let source_kbps = select! {
            biased;
            kbps = probe_bitrate(&self.ffmpeg_path, &input.path) => kbps?,
            _ = self.cancel.cancelled() => bail!("Cancelled while probing"),
        };
        job_debug!(input, "Source bitrate: {source_kbps} kb/s");

        let job = input.to_job(source_kbps)?;
        let plan = job.plan();
        if plan.is_degenerate() {
            bail!(
                "Could not determine a usable source bitrate ({source_kbps} kb/s), not encoding at {}",
                plan.bitrate_arg()
            );
        }
        let child_args = job.ffmpeg_args(&plan, &self.get_extra_args(input)?);

        // The probe can finish just as the batch is cancelled. Nothing has been written yet.
        if self.cancel.is_cancelled() {
            bail!("Cancelled before encoding");
        }

        job_info!(input, "");
        job_info!(input, "Executing: {:?} {:?}", &self.ffmpeg_path, child_args);
        job_info!(input, "");

        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args(&child_args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(report_path) = input.report_path() {
            input.create_log_directory()?;
            command.env("FFREPORT", ffreport_value(&report_path));
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Could not start {:?}", self.ffmpeg_path))?;

        let status = select! {
            biased;
            status = child.wait() => status?,
            _ = self.cancel.cancelled() => {
                job_warn!(input, "Stopping the encode of {:?}", input.path);
                child.kill().await?;
                if let Err(err) = tokio::fs::remove_file(&job.output).await {
                    job_debug!(input, "Could not remove partial output {:?}: {}", job.output, err);
                }
                bail!("Cancelled while encoding");
            }
        };

        if !status.success() {
            bail!("Encoding error ({status}). Check the ffmpeg log or arguments");
        }
        job_info!(input, "Encoded {:?} at {}", job.output, plan.bitrate_arg());
        Ok(())
    }
}

/// Ask until the answer is yes or no. The end of input counts as no.
pub fn confirm<R: BufRead, W: Write>(mut input: R, mut output: W) -> Result<bool> {
    loop {
        write!(output, "Encode the files listed above? [y/n]: ")?;
        output.flush()?;
        let mut answer = String::new();
        if input.read_line(&mut answer)? == 0 {
            writeln!(output)?;
            return Ok(false);
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => writeln!(output, "Please answer y or n.")?,
        }
    }
}

/// The FFREPORT value for a report file. ':' and '\' must be escaped.
fn ffreport_value(report_path: &Path) -> OsString {
    let mut ffreport = OsString::from("file=");
    let lossy = report_path.to_string_lossy();
    if lossy.contains(':') || lossy.contains('\\') {
        ffreport.push(lossy.replace('\\', r"\\").replace(':', r"\:"));
    } else {
        // It's preferable to not use lossy decoding unless characters need to be replaced:
        ffreport.push(report_path);
    }
    ffreport
}

fn extension_matches(fname: &Path, video_re: &Regex) -> Result<bool> {
    if let Some(extension) = fname.extension() {
        let extension = extension
            .to_ascii_lowercase()
            .to_str()
            .map(|s| s.to_string())
            .ok_or(anyhow!("Path can't be represented as utf-8: {:?}", &fname))?;
        return Ok(video_re.is_match(&extension));
    }
    Ok(false)
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Let the user override the path to ffmpeg with $FFMPEG.
fn find_executable() -> FoundExecutable {
    if let Some(variable_value) = env::var_os("FFMPEG") {
        if !variable_value.is_empty() {
            return FoundExecutable {
                path: variable_value,
                from_env: true,
            };
        }
    }
    FoundExecutable {
        path: "ffmpeg".into(),
        from_env: false,
    }
}

pub fn get_output_dir(args: &Args) -> PathBuf {
    args.output_dir
        .as_ref()
        .map_or(args.input_dir.join(OUTPUT_DIR), |path| path.to_owned())
}
