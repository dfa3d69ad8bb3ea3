use std::{ffi::OsString, path::Path, path::PathBuf};

use nvbatch::*;

fn job(input: &str, source_kbps: u64, quality: Option<Quality>, resolution: Option<&str>) -> Job {
    Job {
        input: PathBuf::from(input),
        output: PathBuf::from("out/video.mp4"),
        source_kbps,
        quality,
        resolution: resolution.map(String::from),
        codec: "hevc_nvenc".to_string(),
    }
}

#[test]
fn test_policy_table() {
    let table = [
        (Some(Quality::Low), 20.0, 200.0, RefMode::Disabled),
        (Some(Quality::Middle), 10.0, 100.0, RefMode::Middle),
        (Some(Quality::High), 5.0, 50.0, RefMode::Each),
        (Some(Quality::Super), 2.0, 2.0, RefMode::Each),
        (None, 2.0, 2.0, FALLBACK_REF_MODE),
    ];
    for (quality, divisor, ts_divisor, mode) in table {
        assert_eq!(bitrate_divisor(quality, false), divisor, "{quality:?}");
        assert_eq!(bitrate_divisor(quality, true), ts_divisor, "{quality:?} ts");
        assert_eq!(ref_mode(quality), mode, "{quality:?}");

        let (target, derived_mode) = derive(10_000, quality, false);
        assert_eq!(target, 10_000.0 / divisor);
        assert_eq!(derived_mode, mode);
        let (target, _) = derive(10_000, quality, true);
        assert_eq!(target, 10_000.0 / ts_divisor);
    }
}

#[test]
fn test_middle_scenarios() {
    assert_eq!(
        derive(5000, Some(Quality::Middle), false),
        (500.0, RefMode::Middle)
    );
    assert_eq!(
        derive(5000, Some(Quality::Middle), true),
        (50.0, RefMode::Middle)
    );
}

#[test]
fn test_unknown_bitrate_is_degenerate() {
    let (target, _) = derive(0, Some(Quality::High), false);
    assert_eq!(target, 0.0);

    let plan = job("a.mp4", 0, Some(Quality::High), None).plan();
    assert!(plan.is_degenerate());
    assert_eq!(plan.bitrate_arg(), "0k");

    let plan = job("a.mp4", 5000, Some(Quality::High), None).plan();
    assert!(!plan.is_degenerate());
}

#[test]
fn test_quality_names() {
    assert_eq!(Quality::from_name("low"), Some(Quality::Low));
    assert_eq!(Quality::from_name("MIDDLE"), Some(Quality::Middle));
    assert_eq!(Quality::from_name(" super "), Some(Quality::Super));
    assert_eq!(Quality::from_name("ultra"), None);
    assert_eq!(Quality::from_name(""), None);
    assert_eq!(Quality::High.to_string(), "high");
}

#[test]
fn test_select_filter() {
    assert_eq!(select_filter(Some("1080p")), Some("scale=-2:1080"));
    assert_eq!(select_filter(Some("720p")), Some("scale=-2:720"));
    assert_eq!(select_filter(Some("480p")), Some("scale=-2:480"));
    for tag in [None, Some(""), Some("4k"), Some("720"), Some("720P")] {
        assert_eq!(select_filter(tag), None, "{tag:?}");
    }
}

#[test]
fn test_transport_stream_detection() {
    assert!(is_transport_stream(Path::new("rec/show.ts")));
    assert!(is_transport_stream(Path::new("rec/show.TS")));
    assert!(is_transport_stream(Path::new("show.m2ts")));
    assert!(!is_transport_stream(Path::new("show.mp4")));
    assert!(!is_transport_stream(Path::new("ts")));
    assert!(!is_transport_stream(Path::new("show.ts.mp4")));
}

#[test]
fn test_plan_uses_container() {
    let plan = job("rec/show.ts", 5000, Some(Quality::Middle), Some("720p")).plan();
    assert_eq!(
        plan,
        EncodingPlan {
            target_kbps: 50.0,
            ref_mode: RefMode::Middle,
            filter: Some("scale=-2:720"),
        }
    );
}

#[test]
fn test_ffmpeg_args() {
    let job = job("in/show.mp4", 5000, Some(Quality::Middle), Some("720p"));
    let plan = job.plan();
    let args = job.ffmpeg_args(&plan, &[]);
    let expected: Vec<OsString> = [
        "-i",
        "in/show.mp4",
        "-c:v",
        "hevc_nvenc",
        "-b:v",
        "500k",
        "-b_ref_mode",
        "middle",
        "-f",
        "mp4",
        "-tag:v",
        "hvc1",
        "-y",
        "-vf",
        "scale=-2:720",
        "out/video.mp4",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    assert_eq!(args, expected);
}

#[test]
fn test_ffmpeg_args_without_filter() {
    let job = job("in/show.mp4", 4000, Some(Quality::High), None);
    let extra = [OsString::from("-t"), OsString::from("5:00")];
    let args = job.ffmpeg_args(&job.plan(), &extra);
    assert!(!args.contains(&OsString::from("-vf")));
    assert_eq!(args[5], OsString::from("800k"));
    assert_eq!(args[7], OsString::from("each"));

    let tail: Vec<_> = args.iter().rev().take(3).rev().cloned().collect();
    assert_eq!(
        tail,
        vec![
            OsString::from("-t"),
            OsString::from("5:00"),
            OsString::from("out/video.mp4")
        ]
    );
}

#[test]
fn test_bitrate_arg_keeps_fraction() {
    // 5010 / 200 on a low quality transport stream:
    let plan = job("a.ts", 5010, Some(Quality::Low), None).plan();
    assert_eq!(plan.target_kbps, 25.05);
    assert_eq!(plan.bitrate_arg(), "25.05k");

    let plan = job("a.ts", 300, Some(Quality::Low), None).plan();
    assert_eq!(plan.bitrate_arg(), "1.5k");
}

#[test]
fn test_small_bitrate_is_not_degenerate() {
    let plan = job("a.ts", 99, Some(Quality::Low), None).plan();
    assert_eq!(plan.target_kbps, 0.495);
    assert_eq!(plan.bitrate_arg(), "0.495k");
    assert!(!plan.is_degenerate());

    let plan = job("a.ts", 1, Some(Quality::Low), None).plan();
    assert!(!plan.is_degenerate());
}
