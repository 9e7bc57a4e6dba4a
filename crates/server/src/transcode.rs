//! Transcoder dispatch: profile selection, command templating, and
//! subprocess streaming.
//!
//! The encoder runs as an external process with stdout piped back to the
//! caller, so streaming starts as soon as the first bytes are produced.
//! Stderr is discarded, matching the chatty-encoder reality of ffmpeg.

use std::process::Stdio;

use tokio::process::{ChildStdout, Command};
use tracing::debug;

use crate::config::TranscoderProfile;

const NORM_FILTER: &str = "-af loudnorm=I=-18";

#[derive(Debug)]
pub enum TranscodeError {
    /// The command template has no `%i` input token.
    BadTemplate(String),
    Spawn(std::io::Error),
}

impl std::fmt::Display for TranscodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscodeError::BadTemplate(name) => {
                write!(f, "transcoder \"{}\" has no input placeholder", name)
            }
            TranscodeError::Spawn(err) => write!(f, "failed to spawn transcoder: {}", err),
        }
    }
}

impl std::error::Error for TranscodeError {}

/// Pick the transcoder for an (input extension, output format) pair.
/// Profiles are in priority order; the first whose output format matches and
/// whose blacklist does not contain the input extension wins. Deterministic
/// for a fixed profile list.
pub fn select_profile<'a>(
    profiles: &'a [TranscoderProfile],
    output_format: &str,
    input_ext: &str,
) -> Option<&'a TranscoderProfile> {
    profiles.iter().find(|profile| {
        profile.output_format == output_format
            && !profile
                .black_formats
                .iter()
                .any(|black| black == input_ext)
    })
}

/// Seek offset in the `H:MM:SS` form the command templates expect.
pub fn format_seek(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{}:{:02}:{:02}", hours, minutes, secs)
}

/// Substitute the runtime parameters into the profile's command template and
/// split it into an argv vector. Exactly one `%i` token is replaced with the
/// input path; `%n` expands to the loudness filter or nothing, so empty
/// tokens are dropped after the split.
pub fn build_argv(
    profile: &TranscoderProfile,
    input_path: &str,
    seek: u64,
    bitrate: u32,
    norm: bool,
) -> Result<Vec<String>, TranscodeError> {
    let bitrate = if bitrate > 0 { bitrate } else { profile.bitrate };
    let command = profile
        .command
        .replace("%s", &format_seek(seek))
        .replace("%b", &bitrate.to_string())
        .replace("%n", if norm { NORM_FILTER } else { "" });

    let mut argv: Vec<String> = command
        .split(' ')
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
        .collect();

    let input_pos = argv
        .iter()
        .position(|token| token == "%i")
        .ok_or_else(|| TranscodeError::BadTemplate(profile.name.clone()))?;
    argv[input_pos] = input_path.to_string();

    Ok(argv)
}

/// Launch the encoder and hand back its stdout for incremental forwarding.
/// The child is reaped in the background once it exits; dropping the stream
/// early kills it.
pub fn spawn_transcoder(
    profile: &TranscoderProfile,
    input_path: &str,
    seek: u64,
    bitrate: u32,
    norm: bool,
) -> Result<ChildStdout, TranscodeError> {
    let argv = build_argv(profile, input_path, seek, bitrate, norm)?;
    debug!("Transcoding with: {}", argv.join(" "));

    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(TranscodeError::Spawn)?;

    let stdout = child.stdout.take().ok_or_else(|| {
        TranscodeError::Spawn(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "child stdout not captured",
        ))
    })?;

    // Wait for the child off to the side so it is reaped without blocking
    // the stream consumer.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_transcoders;

    fn profile(name: &str, output: &str, black: &[&str]) -> TranscoderProfile {
        TranscoderProfile {
            name: name.to_string(),
            command: "ffmpeg -loglevel quiet -ss %s -i %i -map 0:a -b:a %bk %n -f fmt -"
                .to_string(),
            bitrate: 192,
            output_format: output.to_string(),
            mime_type: "audio/test".to_string(),
            black_formats: black.iter().map(|s| s.to_string()).collect(),
            buffer_kb: 200,
        }
    }

    #[test]
    fn selection_follows_priority_order() {
        let profiles = vec![
            profile("first-mp3", "mp3", &[]),
            profile("second-mp3", "mp3", &[]),
            profile("ogg", "ogg", &[]),
        ];
        let selected = select_profile(&profiles, "mp3", "flac").unwrap();
        assert_eq!(selected.name, "first-mp3");
        // Repeated calls are deterministic.
        for _ in 0..10 {
            assert_eq!(select_profile(&profiles, "mp3", "flac").unwrap().name, "first-mp3");
        }
    }

    #[test]
    fn blacklisted_input_falls_through_to_the_next_profile() {
        let profiles = vec![
            profile("no-flac", "mp3", &["flac"]),
            profile("any", "mp3", &[]),
        ];
        assert_eq!(select_profile(&profiles, "mp3", "flac").unwrap().name, "any");
        assert_eq!(select_profile(&profiles, "mp3", "ogg").unwrap().name, "no-flac");
    }

    #[test]
    fn no_match_returns_none() {
        let profiles = vec![profile("no-flac", "mp3", &["flac"])];
        assert!(select_profile(&profiles, "wav", "mp3").is_none());
        assert!(select_profile(&[], "mp3", "flac").is_none());
    }

    #[test]
    fn seek_is_formatted_h_mm_ss() {
        assert_eq!(format_seek(0), "0:00:00");
        assert_eq!(format_seek(125), "0:02:05");
        assert_eq!(format_seek(3600), "1:00:00");
        assert_eq!(format_seek(7325), "2:02:05");
    }

    #[test]
    fn argv_substitutes_exactly_one_input_token() {
        let profiles = default_transcoders();
        let argv = build_argv(&profiles[0], "/music/a b/song.flac", 125, 0, false).unwrap();
        assert_eq!(
            argv.iter().filter(|token| *token == "/music/a b/song.flac").count(),
            1
        );
        assert!(argv.iter().all(|token| token != "%i"));
        // The path survives as a single argv entry even with spaces.
        assert!(argv.contains(&"/music/a b/song.flac".to_string()));
        // Seek and default bitrate are substituted.
        assert!(argv.contains(&"0:02:05".to_string()));
        assert!(argv.contains(&"192k".to_string()));
    }

    #[test]
    fn bitrate_override_beats_profile_default() {
        let profiles = default_transcoders();
        let argv = build_argv(&profiles[0], "/music/song.flac", 0, 64, false).unwrap();
        assert!(argv.contains(&"64k".to_string()));
    }

    #[test]
    fn norm_flag_expands_or_disappears() {
        let profiles = default_transcoders();
        let argv = build_argv(&profiles[0], "/in.flac", 0, 0, true).unwrap();
        assert!(argv.contains(&"-af".to_string()));
        assert!(argv.contains(&"loudnorm=I=-18".to_string()));

        let argv = build_argv(&profiles[0], "/in.flac", 0, 0, false).unwrap();
        assert!(!argv.contains(&"-af".to_string()));
        // No empty tokens linger where %n was.
        assert!(argv.iter().all(|token| !token.is_empty()));
    }

    #[test]
    fn template_without_input_token_is_rejected() {
        let mut bad = profile("bad", "mp3", &[]);
        bad.command = "ffmpeg -f mp3 -".to_string();
        assert!(matches!(
            build_argv(&bad, "/in.flac", 0, 0, false),
            Err(TranscodeError::BadTemplate(_))
        ));
    }
}
