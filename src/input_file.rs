use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::{get_output_dir, is_transport_stream, Args, Job, Quality};
use crate::job_warn;

/// A video found in the input directory, before it has been probed.
pub struct InputFile {
    pub path: PathBuf,
    pub output_path: PathBuf,
    pub log_path: Option<PathBuf>,
    args: Arc<Args>,
}

impl InputFile {
    pub fn new(path: &Path, args: Arc<Args>) -> Result<Self> {
        Ok(Self {
            path: path.to_owned(),
            output_path: Self::get_output_path(path, &args)?,
            log_path: Self::get_log_path(path, &args)?,
            args,
        })
    }

    /// Outputs are always mp4, named after the input's stem: `a/b/show.ts` becomes
    /// `<output dir>/show.mp4`.
    fn get_output_path(input_path: &Path, args: &Args) -> Result<PathBuf> {
        let stem = input_path
            .file_stem()
            .with_context(|| format!("Input path has no file name: {input_path:?}"))?;
        let mut name = stem.to_owned();
        name.push(".mp4");
        Ok(get_output_dir(args).join(name))
    }

    /// The log path is next to the output, named after the whole input filename so that
    /// `show.ts` and `show.mp4` don't share a log.
    fn get_log_path(input_path: &Path, args: &Args) -> Result<Option<PathBuf>> {
        if args.no_log {
            return Ok(None);
        }
        let mut name = input_path
            .file_name()
            .with_context(|| format!("Input path has no file name: {input_path:?}"))?
            .to_owned();
        name.push(".log");
        Ok(Some(get_output_dir(args).join(name)))
    }

    /// Nothing is written before the user confirms the batch, so the directory is created on
    /// first use.
    pub(crate) fn create_log_directory(&self) -> Result<()> {
        let Some(parent) = self.log_path.as_ref().and_then(|path| path.parent()) else {
            return Ok(());
        };
        if !parent.is_dir() {
            if parent.exists() {
                bail!(
                    "Cannot make log file in {:?} because it exists but is not a directory.",
                    parent
                );
            }
            // No need for a mutex, this is thread-safe:
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Where ffmpeg writes its own report (via FFREPORT) for this input.
    pub fn report_path(&self) -> Option<PathBuf> {
        let log_path = self.log_path.as_ref()?;
        let mut name = self.path.file_name()?.to_owned();
        name.push(".ffmpeg.log");
        Some(log_path.with_file_name(name))
    }

    pub fn is_transport_stream(&self) -> bool {
        is_transport_stream(&self.path)
    }

    /// True if the output exists and we may not replace it. Such a file is skipped without
    /// running ffmpeg.
    pub fn output_blocked(&self) -> bool {
        !self.args.overwrite && self.output_path.exists()
    }

    /// Build the job for this file once its source bitrate is known.
    pub fn to_job(&self, source_kbps: u64) -> Result<Job> {
        let quality = match self.env_quality()? {
            Some(name) => {
                let quality = Quality::from_name(&name);
                if quality.is_none() {
                    job_warn!(
                        self,
                        "Unrecognized quality tier {name:?}, using the fallback bitrate policy"
                    );
                }
                quality
            }
            None => Some(self.args.quality),
        };
        Ok(Job {
            input: self.path.clone(),
            output: self.output_path.clone(),
            source_kbps,
            quality,
            resolution: self.args.resolution.clone(),
            codec: self.args.codec.clone(),
        })
    }

    /// Get the last part of the filename (without directory parts).
    pub fn basename(&self) -> Result<OsString> {
        self.path
            .components()
            .last()
            .map(|comp| comp.as_os_str().to_owned())
            .context("Path is empty")
    }

    /// Get the core part of the filename (without directory parts or extension).
    pub fn core_filename(&self) -> Result<OsString> {
        Ok(PathBuf::from(self.basename()?)
            .with_extension("")
            .into_os_string())
    }

    fn env_arg_names(&self) -> Result<[String; 2]> {
        let special = Regex::new("[^a-zA-Z0-9_]")?;
        Ok([self.basename()?, self.core_filename()?].map(|name| {
            let name = name.to_string_lossy();
            special.replace_all(&name, "_").to_string()
        }))
    }

    /// Look up `<PREFIX>_name.mp4`, then `<PREFIX>_name`, with special characters in the name
    /// replaced by '_'.
    fn env_for_file(&self, prefix: &str) -> Result<Option<String>> {
        let var_names = self.env_arg_names()?.map(|name| format!("{prefix}_{name}"));
        env::var_os(&var_names[0])
            .or(env::var_os(&var_names[1]))
            .map(|s| {
                s.into_string()
                    .ok()
                    .with_context(|| format!("{prefix} override for {:?} is not utf-8", self.path))
            })
            .transpose()
    }

    /// Extra ffmpeg arguments for this video only, from `FFMPEG_<name>`.
    pub(crate) fn env_ffmpeg_args(&self) -> Result<Option<String>> {
        self.env_for_file("FFMPEG")
    }

    /// A quality tier for this video only, from `QUALITY_<name>`.
    pub(crate) fn env_quality(&self) -> Result<Option<String>> {
        self.env_for_file("QUALITY")
    }
}
