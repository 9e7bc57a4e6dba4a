use std::fs::File;
use std::path::Path;

use common::TagBackend;
use lofty::error::LoftyError;
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;

/// Normalized tag values for one audio file. Only the recognized keys are
/// kept; anything else in the file is ignored. Empty strings are treated as
/// absent by callers.
#[derive(Debug, Default, Clone)]
pub struct TagSet {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub disc: Option<String>,
    pub year: Option<String>,
    pub track_number: Option<String>,
    pub track_total: Option<String>,
    pub composer: Option<String>,
    pub performer: Option<String>,
    pub copyright: Option<String>,
    pub contact: Option<String>,
    pub encoded_by: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TechnicalInfo {
    pub duration_secs: u32,
    /// Best-effort kbps; zero when the container exposes none.
    pub bitrate_kbps: u32,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
    Symphonia(SymphoniaError),
}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

impl From<SymphoniaError> for MetadataError {
    fn from(err: SymphoniaError) -> Self {
        MetadataError::Symphonia(err)
    }
}

/// Read tags and technical info from an audio file with the selected
/// backend. Any error is returned to the caller, which skips the file and
/// keeps scanning.
pub fn read_tags(path: &Path, backend: TagBackend) -> Result<(TagSet, TechnicalInfo), MetadataError> {
    match backend {
        TagBackend::Lofty => read_tags_lofty(path),
        TagBackend::Symphonia => read_tags_symphonia(path),
    }
}

fn read_tags_lofty(path: &Path) -> Result<(TagSet, TechnicalInfo), MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let info = TechnicalInfo {
        duration_secs: clamp_u64(properties.duration().as_secs()),
        bitrate_kbps: properties
            .audio_bitrate()
            .or(properties.overall_bitrate())
            .unwrap_or(0),
    };

    let mut tags = TagSet::default();
    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        let get = |key: &ItemKey| tag.get_string(key).map(|v| v.to_string());
        tags.title = get(&ItemKey::TrackTitle);
        tags.artist = get(&ItemKey::TrackArtist);
        tags.album = get(&ItemKey::AlbumTitle);
        tags.album_artist = get(&ItemKey::AlbumArtist);
        tags.genre = get(&ItemKey::Genre);
        tags.disc = get(&ItemKey::DiscNumber);
        tags.year = get(&ItemKey::Year).or_else(|| get(&ItemKey::RecordingDate));
        tags.track_number = get(&ItemKey::TrackNumber);
        tags.track_total = get(&ItemKey::TrackTotal);
        tags.composer = get(&ItemKey::Composer);
        tags.performer = get(&ItemKey::Performer);
        tags.copyright = get(&ItemKey::CopyrightMessage);
        tags.contact = get(&ItemKey::Unknown("CONTACT".to_string()));
        tags.encoded_by = get(&ItemKey::EncodedBy);
        tags.description = get(&ItemKey::Description);
    }

    Ok((tags, info))
}

fn read_tags_symphonia(path: &Path) -> Result<(TagSet, TechnicalInfo), MetadataError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
        hint.with_extension(ext);
    }
    let mut probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut tags = TagSet::default();
    if let Some(metadata) = probed.metadata.get() {
        if let Some(revision) = metadata.current() {
            for tag in revision.tags() {
                apply_symphonia_tag(&mut tags, tag.std_key, &tag.key, tag.value.to_string());
            }
        }
    }
    let mut format = probed.format;
    if let Some(revision) = format.metadata().current() {
        for tag in revision.tags() {
            apply_symphonia_tag(&mut tags, tag.std_key, &tag.key, tag.value.to_string());
        }
    }

    let mut info = TechnicalInfo::default();
    if let Some(track) = format.default_track() {
        let params = &track.codec_params;
        if let (Some(time_base), Some(n_frames)) = (params.time_base, params.n_frames) {
            let time = time_base.calc_time(n_frames);
            info.duration_secs = clamp_u64(time.seconds);
        }
        // Bitrate is not surfaced by this backend; callers get zero.
    }

    Ok((tags, info))
}

fn apply_symphonia_tag(
    tags: &mut TagSet,
    std_key: Option<StandardTagKey>,
    raw_key: &str,
    value: String,
) {
    if value.trim().is_empty() {
        return;
    }
    let slot = match std_key {
        Some(key) => match key {
            StandardTagKey::TrackTitle => Some(&mut tags.title),
            StandardTagKey::Artist => Some(&mut tags.artist),
            StandardTagKey::Album => Some(&mut tags.album),
            StandardTagKey::AlbumArtist => Some(&mut tags.album_artist),
            StandardTagKey::Genre => Some(&mut tags.genre),
            StandardTagKey::DiscNumber => Some(&mut tags.disc),
            StandardTagKey::Date | StandardTagKey::ReleaseDate => Some(&mut tags.year),
            StandardTagKey::TrackNumber => Some(&mut tags.track_number),
            StandardTagKey::TrackTotal => Some(&mut tags.track_total),
            StandardTagKey::Composer => Some(&mut tags.composer),
            StandardTagKey::Performer => Some(&mut tags.performer),
            StandardTagKey::Copyright => Some(&mut tags.copyright),
            StandardTagKey::EncodedBy => Some(&mut tags.encoded_by),
            StandardTagKey::Description => Some(&mut tags.description),
            _ => None,
        },
        None => slot_for_raw_key(tags, raw_key),
    };
    if let Some(slot) = slot {
        if slot.is_none() {
            *slot = Some(value);
        }
    }
}

/// Map a raw (vorbis-style) tag key to its slot, case-insensitively.
/// Unrecognized keys are dropped.
fn slot_for_raw_key<'a>(tags: &'a mut TagSet, raw_key: &str) -> Option<&'a mut Option<String>> {
    match raw_key.to_ascii_uppercase().as_str() {
        "TITLE" => Some(&mut tags.title),
        "ARTIST" => Some(&mut tags.artist),
        "ALBUM" => Some(&mut tags.album),
        "ALBUMARTIST" => Some(&mut tags.album_artist),
        "GENRE" => Some(&mut tags.genre),
        "DISCNUMBER" => Some(&mut tags.disc),
        "DATE" => Some(&mut tags.year),
        "TRACKNUMBER" => Some(&mut tags.track_number),
        "TRACKTOTAL" => Some(&mut tags.track_total),
        "COMPOSER" => Some(&mut tags.composer),
        "PERFORMER" => Some(&mut tags.performer),
        "COPYRIGHT" => Some(&mut tags.copyright),
        "CONTACT" => Some(&mut tags.contact),
        "ENCODED-BY" => Some(&mut tags.encoded_by),
        "DESCRIPTION" => Some(&mut tags.description),
        _ => None,
    }
}

fn clamp_u64(value: u64) -> u32 {
    value.min(u64::from(u32::MAX)) as u32
}
