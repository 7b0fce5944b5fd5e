//! Render jobs: the stage functions callers invoke with an opaque replay
//! byte buffer, and the progress-sink contract the surrounding queue polls.
//!
//! Stage failures are classified into [`RenderJobError`] exactly once, here;
//! nothing below this layer escapes as an untyped error.

use std::io::{Cursor, Read};
use std::path::Path;
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, info};

use warships_replays::ReplayFile;
use warships_replays::analyzer::battle_controller::{ReplayModel, decode_replay, format_mmss};
use warships_replays::types::SUPPORTED_BATTLE_TYPES;

use crate::RenderJobError;
use crate::assets::ResourceBundle;
use crate::dual::DualMergeEngine;
use crate::renderer::{RenderEngine, RenderOptions, RenderRole};

/// External job-progress collaborator. Implementations write to whatever
/// store the polling consumer reads.
pub trait ProgressSink {
    fn status(&self, _status: &str) {}
    fn progress(&self, _fraction: f64) {}
}

/// Sink for callers that don't track progress.
pub struct NoopSink;

impl ProgressSink for NoopSink {}

/// Successful render result.
pub struct RenderOutput {
    pub video: Bytes,
    /// Short id for naming the delivered file: four letters A-F followed by
    /// eight digits.
    pub render_id: String,
    /// Wall-clock `MM:SS` the job took.
    pub elapsed: String,
}

/// Renders a single replay into an annotated minimap video.
pub fn render_single(
    data: &[u8],
    assets_root: &Path,
    options: RenderOptions,
    sink: &dyn ProgressSink,
) -> Result<RenderOutput, RenderJobError> {
    let started = Instant::now();

    sink.status("Reading");
    let model = parse_replay(data)?;
    let bundle = ResourceBundle::resolve(assets_root, &model.version)?;

    sink.status("Rendering");
    let mut engine = RenderEngine::new(model, bundle, options, RenderRole::Single, None)?;
    let video = engine.render(sink)?;

    Ok(finish_output(video, started))
}

/// Renders a dual-perspective merge from a zip holding the two sides'
/// replays. Archive preconditions are checked before any decode work.
pub fn render_dual(
    zip_bytes: &[u8],
    assets_root: &Path,
    sink: &dyn ProgressSink,
) -> Result<RenderOutput, RenderJobError> {
    let started = Instant::now();

    let (replay_a, replay_b) = read_dual_archive(zip_bytes)?;

    sink.status("Reading Replay A...");
    let model_a = parse_replay(&replay_a)?;
    sink.status("Reading Replay B...");
    let model_b = parse_replay(&replay_b)?;

    let bundle_a = ResourceBundle::resolve(assets_root, &model_a.version)?;
    let bundle_b = ResourceBundle::resolve(assets_root, &model_b.version)?;

    sink.status("Rendering");
    let mut engine = DualMergeEngine::new(model_a, model_b, bundle_a, bundle_b)?;
    let video = engine.render(sink)?;

    Ok(finish_output(video, started))
}

/// Decode stage: container, battle-type gate, then the full packet walk.
pub fn parse_replay(data: &[u8]) -> Result<ReplayModel, RenderJobError> {
    let replay = ReplayFile::from_bytes(data)?;
    check_battle_type(replay.meta.game_mode)?;
    let model = decode_replay(&replay)?;
    debug!(
        arena_id = model.arena_id,
        ticks = model.timeline.len(),
        "replay decoded"
    );
    Ok(model)
}

pub(crate) fn check_battle_type(battle_type: i32) -> Result<(), RenderJobError> {
    if SUPPORTED_BATTLE_TYPES.contains(&battle_type) {
        Ok(())
    } else {
        Err(RenderJobError::UnsupportedBattleType(battle_type))
    }
}

/// Extracts the two replays from the dual-mode archive. File roles are
/// disambiguated by a leading `a`/`A` vs `b`/`B` name prefix.
pub fn read_dual_archive(data: &[u8]) -> Result<(Vec<u8>, Vec<u8>), RenderJobError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| RenderJobError::ReadingError(format!("bad archive: {e}")))?;

    if archive.len() > 2 {
        return Err(RenderJobError::MultipleReplaysFound(archive.len()));
    }
    if archive.len() < 2 {
        return Err(RenderJobError::NotEnoughReplaysFound(
            "expected two replay files".to_string(),
        ));
    }

    let mut side_a: Option<Vec<u8>> = None;
    let mut side_b: Option<Vec<u8>> = None;
    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| RenderJobError::ReadingError(format!("bad archive entry: {e}")))?;
        let prefix = file.name().chars().next().map(|c| c.to_ascii_lowercase());

        let mut content = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut content)
            .map_err(|e| RenderJobError::ReadingError(format!("bad archive entry: {e}")))?;

        match prefix {
            Some('a') => side_a = Some(content),
            Some('b') => side_b = Some(content),
            _ => {}
        }
    }

    let missing: Vec<&str> = [("a", side_a.is_none()), ("b", side_b.is_none())]
        .iter()
        .filter(|(_, absent)| *absent)
        .map(|(prefix, _)| *prefix)
        .collect();
    if !missing.is_empty() {
        let wanted = missing
            .iter()
            .map(|p| format!("`{p}`, `{}`", p.to_uppercase()))
            .collect::<Vec<_>>()
            .join(" or ");
        return Err(RenderJobError::NotEnoughReplaysFound(format!(
            "no replay file starting with {wanted}"
        )));
    }

    Ok((side_a.expect("checked above"), side_b.expect("checked above")))
}

fn finish_output(video: Bytes, started: Instant) -> RenderOutput {
    let elapsed = format_mmss(started.elapsed().as_secs() as i64);
    let render_id = random_render_id();
    info!(%render_id, %elapsed, bytes = video.len(), "render job finished");
    RenderOutput {
        video,
        render_id,
        elapsed,
    }
}

fn random_render_id() -> String {
    let mut rng = rand::thread_rng();
    let mut id: String = (0..4).map(|_| (b'A' + rng.gen_range(0..6u8)) as char).collect();
    for _ in 0..8 {
        id.push(char::from_digit(rng.gen_range(0..10u32), 10).expect("digit in range"));
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn build_zip(names: &[&str]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            for name in names {
                writer
                    .start_file(*name, FileOptions::default())
                    .unwrap();
                writer.write_all(b"replay-bytes").unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn dual_archive_happy_path_is_case_insensitive() {
        let zip = build_zip(&["B_enemy.wowsreplay", "a_friendly.wowsreplay"]);
        let (a, b) = read_dual_archive(&zip).unwrap();
        assert_eq!(a, b"replay-bytes");
        assert_eq!(b, b"replay-bytes");
    }

    #[test]
    fn dual_archive_rejects_extra_files() {
        let zip = build_zip(&["a.wowsreplay", "b.wowsreplay", "c.wowsreplay"]);
        assert!(matches!(
            read_dual_archive(&zip),
            Err(RenderJobError::MultipleReplaysFound(3))
        ));
    }

    #[test]
    fn dual_archive_rejects_single_file() {
        let zip = build_zip(&["a.wowsreplay"]);
        assert!(matches!(
            read_dual_archive(&zip),
            Err(RenderJobError::NotEnoughReplaysFound(_))
        ));
    }

    #[test]
    fn dual_archive_names_the_missing_prefix() {
        let zip = build_zip(&["aTeam.wowsreplay", "cTeam.wowsreplay"]);
        let err = read_dual_archive(&zip).unwrap_err();
        let RenderJobError::NotEnoughReplaysFound(message) = err else {
            panic!("wrong error kind");
        };
        assert!(message.contains("`b`, `B`"), "message was: {message}");
        assert!(!message.contains("`a`,"), "message was: {message}");
    }

    #[test]
    fn battle_type_gate() {
        assert!(check_battle_type(7).is_ok());
        assert!(check_battle_type(14).is_ok());
        assert!(matches!(
            check_battle_type(5),
            Err(RenderJobError::UnsupportedBattleType(5))
        ));
    }

    #[test]
    fn version_errors_classify_as_version_not_supported() {
        let err: RenderJobError =
            warships_replays::Error::UnsupportedVersion("0.9.9".to_string()).into();
        assert!(matches!(err, RenderJobError::VersionNotSupported(v) if v == "0.9.9"));

        let err: RenderJobError =
            warships_replays::Error::Corrupt("truncated".to_string()).into();
        assert!(matches!(err, RenderJobError::ReadingError(_)));
    }

    #[test]
    fn render_ids_have_the_expected_shape() {
        for _ in 0..16 {
            let id = random_render_id();
            assert_eq!(id.len(), 12);
            assert!(id[..4].chars().all(|c| ('A'..='F').contains(&c)));
            assert!(id[4..].chars().all(|c| c.is_ascii_digit()));
        }
    }
}
