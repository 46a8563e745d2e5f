use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::sqlite::configure_connection;

use super::models::{
    CatalogMetrics, SegmentRecord, SubtitleTrackRecord, VideoRecord, VideoStatus,
};
use super::{CatalogError, CatalogResult};

const CATALOG_SCHEMA: &str = include_str!("../../../sql/catalog.sql");

#[derive(Debug, Clone)]
pub struct SqliteCatalogStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteCatalogStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteCatalogStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> CatalogResult<SqliteCatalogStore> {
        let path = self.path.ok_or(CatalogError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteCatalogStore { path, flags })
    }
}

/// Handle to the catalog database. Cheap to clone; every call opens a
/// short-lived connection so no lock outlives a method.
#[derive(Debug, Clone)]
pub struct SqliteCatalogStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteCatalogStore {
    pub fn builder() -> SqliteCatalogStoreBuilder {
        SqliteCatalogStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> CatalogResult<Self> {
        SqliteCatalogStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> CatalogResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            CatalogError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| CatalogError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> CatalogResult<()> {
        let conn = self.open()?;
        conn.execute_batch(CATALOG_SCHEMA)?;
        Ok(())
    }

    pub fn insert_video(&self, video: &VideoRecord) -> CatalogResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO videos (
                id, filename, duration, total_segments, byte_size,
                video_codec, audio_codec, container, status, error_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &video.id,
                &video.filename,
                video.duration,
                video.total_segments,
                video.byte_size,
                &video.video_codec,
                &video.audio_codec,
                &video.container,
                video.status.as_str(),
                &video.error_reason,
            ],
        )?;
        Ok(())
    }

    pub fn video_by_id(&self, video_id: &str) -> CatalogResult<Option<VideoRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM videos WHERE id = ?1")?;
        let video = stmt
            .query_row([video_id], |row| VideoRecord::from_row(row))
            .optional()?;
        Ok(video)
    }

    pub fn video_exists(&self, video_id: &str) -> CatalogResult<bool> {
        let conn = self.open()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM videos WHERE id = ?1", [video_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_videos(
        &self,
        status: Option<VideoStatus>,
        limit: usize,
        offset: usize,
    ) -> CatalogResult<Vec<VideoRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM videos
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, id ASC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(
                (
                    status.as_ref().map(VideoStatus::as_str),
                    limit as i64,
                    offset as i64,
                ),
                |row| VideoRecord::from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn videos_in_status(&self, status: VideoStatus) -> CatalogResult<Vec<VideoRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM videos WHERE status = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([status.as_str()], |row| VideoRecord::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_video_status(&self, video_id: &str, status: VideoStatus) -> CatalogResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos SET status = ?2, updated_at = CURRENT_TIMESTAMP WHERE id = ?1",
            params![video_id, status.as_str()],
        )?;
        if affected == 0 {
            return Err(CatalogError::NotFound {
                video_id: video_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn mark_error(&self, video_id: &str, reason: &str) -> CatalogResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos
             SET status = 'error', error_reason = ?2, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            params![video_id, reason],
        )?;
        if affected == 0 {
            return Err(CatalogError::NotFound {
                video_id: video_id.to_string(),
            });
        }
        Ok(())
    }

    /// Record what the probe learned about a `processing` video.
    pub fn update_media_info(
        &self,
        video_id: &str,
        container: &str,
        video_codec: Option<&str>,
        audio_codec: Option<&str>,
        duration: f64,
    ) -> CatalogResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos
             SET container = ?2, video_codec = ?3, audio_codec = ?4, duration = ?5,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            params![video_id, container, video_codec, audio_codec, duration],
        )?;
        if affected == 0 {
            return Err(CatalogError::NotFound {
                video_id: video_id.to_string(),
            });
        }
        Ok(())
    }

    /// Final ingest commit: totals plus the flip to `active` in one
    /// transaction.
    pub fn finalize_video(
        &self,
        video_id: &str,
        duration: f64,
        total_segments: i64,
        byte_size: i64,
    ) -> CatalogResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos
             SET duration = ?2, total_segments = ?3, byte_size = ?4,
                 status = 'active', error_reason = NULL,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            params![video_id, duration, total_segments, byte_size],
        )?;
        if affected == 0 {
            return Err(CatalogError::NotFound {
                video_id: video_id.to_string(),
            });
        }
        Ok(())
    }

    /// Single-row insert in its own transaction; the distributor calls this
    /// once per successfully uploaded segment.
    pub fn insert_segment(&self, segment: &SegmentRecord) -> CatalogResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO segments (
                video_id, ordinal, filename, duration, byte_size, handle, account_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &segment.video_id,
                segment.ordinal,
                &segment.filename,
                segment.duration,
                segment.byte_size,
                &segment.handle,
                &segment.account_id,
            ],
        )?;
        Ok(())
    }

    pub fn segments_for_video(&self, video_id: &str) -> CatalogResult<Vec<SegmentRecord>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM segments WHERE video_id = ?1 ORDER BY ordinal ASC")?;
        let rows = stmt
            .query_map([video_id], |row| SegmentRecord::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn segment(&self, video_id: &str, ordinal: i64) -> CatalogResult<Option<SegmentRecord>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM segments WHERE video_id = ?1 AND ordinal = ?2")?;
        let segment = stmt
            .query_row(params![video_id, ordinal], |row| {
                SegmentRecord::from_row(row)
            })
            .optional()?;
        Ok(segment)
    }

    pub fn segment_by_filename(
        &self,
        video_id: &str,
        filename: &str,
    ) -> CatalogResult<Option<SegmentRecord>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM segments WHERE video_id = ?1 AND filename = ?2")?;
        let segment = stmt
            .query_row(params![video_id, filename], |row| {
                SegmentRecord::from_row(row)
            })
            .optional()?;
        Ok(segment)
    }

    pub fn delete_segments(&self, video_id: &str) -> CatalogResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute("DELETE FROM segments WHERE video_id = ?1", [video_id])?;
        Ok(affected)
    }

    pub fn insert_subtitle(&self, track: &SubtitleTrackRecord) -> CatalogResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO subtitle_tracks (
                video_id, track_index, language, title, codec,
                is_default, is_forced, is_hearing_impaired, handle, account_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &track.video_id,
                track.track_index,
                &track.language,
                &track.title,
                &track.codec,
                track.is_default as i64,
                track.is_forced as i64,
                track.is_hearing_impaired as i64,
                &track.handle,
                &track.account_id,
            ],
        )?;
        Ok(())
    }

    pub fn subtitles_for_video(&self, video_id: &str) -> CatalogResult<Vec<SubtitleTrackRecord>> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare("SELECT * FROM subtitle_tracks WHERE video_id = ?1 ORDER BY track_index")?;
        let rows = stmt
            .query_map([video_id], |row| SubtitleTrackRecord::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn subtitle_by_language(
        &self,
        video_id: &str,
        language: &str,
    ) -> CatalogResult<Option<SubtitleTrackRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM subtitle_tracks
             WHERE video_id = ?1 AND language = ?2
             ORDER BY track_index LIMIT 1",
        )?;
        let track = stmt
            .query_row(params![video_id, language], |row| {
                SubtitleTrackRecord::from_row(row)
            })
            .optional()?;
        Ok(track)
    }

    /// Delete a video and all owned rows in one transaction, returning the
    /// `(handle, account_id)` pairs for best-effort remote cleanup. `None`
    /// when the video does not exist.
    pub fn delete_video(&self, video_id: &str) -> CatalogResult<Option<Vec<(String, String)>>> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM videos WHERE id = ?1", [video_id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }
        let mut handles = Vec::new();
        {
            let mut stmt =
                tx.prepare("SELECT handle, account_id FROM segments WHERE video_id = ?1")?;
            for row in stmt.query_map([video_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })? {
                handles.push(row?);
            }
            let mut stmt =
                tx.prepare("SELECT handle, account_id FROM subtitle_tracks WHERE video_id = ?1")?;
            for row in stmt.query_map([video_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })? {
                handles.push(row?);
            }
        }
        tx.execute("DELETE FROM videos WHERE id = ?1", [video_id])?;
        tx.commit()?;
        Ok(Some(handles))
    }

    pub fn count_by_status(&self) -> CatalogResult<HashMap<String, usize>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM videos GROUP BY status")?;
        let mut map = HashMap::new();
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (status, count) = row?;
            map.insert(status, count as usize);
        }
        Ok(map)
    }

    pub fn compute_metrics(&self) -> CatalogResult<CatalogMetrics> {
        let by_status = self.count_by_status()?;
        let videos = by_status.values().copied().sum();
        let conn = self.open()?;
        let segments: i64 = conn.query_row("SELECT COUNT(*) FROM segments", [], |row| row.get(0))?;
        let total_bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(byte_size), 0) FROM segments",
            [],
            |row| row.get(0),
        )?;
        Ok(CatalogMetrics {
            videos,
            by_status,
            segments: segments as usize,
            total_bytes,
        })
    }

    /// Read-path invariant check for an active video: dense ordinals and a
    /// count matching `total_segments`.
    pub fn verify_integrity(&self, video: &VideoRecord) -> CatalogResult<Vec<SegmentRecord>> {
        let segments = self.segments_for_video(&video.id)?;
        if segments.len() as i64 != video.total_segments {
            return Err(CatalogError::Integrity {
                video_id: video.id.clone(),
                detail: format!(
                    "expected {} segments, found {}",
                    video.total_segments,
                    segments.len()
                ),
            });
        }
        for (index, segment) in segments.iter().enumerate() {
            if segment.ordinal != index as i64 {
                return Err(CatalogError::Integrity {
                    video_id: video.id.clone(),
                    detail: format!("ordinal gap at {index}, found {}", segment.ordinal),
                });
            }
        }
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, SqliteCatalogStore) {
        let temp = TempDir::new().unwrap();
        let store = SqliteCatalogStore::new(temp.path().join("catalog.sqlite")).unwrap();
        store.initialize().unwrap();
        (temp, store)
    }

    fn sample_segment(video_id: &str, ordinal: i64) -> SegmentRecord {
        SegmentRecord {
            video_id: video_id.to_string(),
            ordinal,
            filename: crate::catalog::segment_filename(ordinal as u32),
            duration: 6.0,
            byte_size: 4_000_000,
            handle: format!("10{ordinal}/file-{ordinal}"),
            account_id: "primary".to_string(),
            created_at: None,
        }
    }

    #[test]
    fn video_roundtrip_and_finalize() {
        let (_temp, store) = test_store();
        let mut video = VideoRecord::new("movie", "movie.mp4");
        video.container = Some("mov,mp4".to_string());
        store.insert_video(&video).unwrap();

        for ordinal in 0..3 {
            store.insert_segment(&sample_segment("movie", ordinal)).unwrap();
        }
        store.finalize_video("movie", 18.0, 3, 12_000_000).unwrap();

        let loaded = store.video_by_id("movie").unwrap().unwrap();
        assert_eq!(loaded.status, VideoStatus::Active);
        assert_eq!(loaded.total_segments, 3);
        let segments = store.verify_integrity(&loaded).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2].filename, "segment_00002.ts");
    }

    #[test]
    fn integrity_detects_ordinal_gap() {
        let (_temp, store) = test_store();
        store.insert_video(&VideoRecord::new("gappy", "gappy.mkv")).unwrap();
        store.insert_segment(&sample_segment("gappy", 0)).unwrap();
        store.insert_segment(&sample_segment("gappy", 2)).unwrap();
        store.finalize_video("gappy", 12.0, 2, 8_000_000).unwrap();

        let video = store.video_by_id("gappy").unwrap().unwrap();
        let err = store.verify_integrity(&video).unwrap_err();
        assert!(matches!(err, CatalogError::Integrity { .. }));
    }

    #[test]
    fn delete_cascades_and_returns_handles() {
        let (_temp, store) = test_store();
        store.insert_video(&VideoRecord::new("gone", "gone.mp4")).unwrap();
        store.insert_segment(&sample_segment("gone", 0)).unwrap();
        store
            .insert_subtitle(&SubtitleTrackRecord {
                video_id: "gone".to_string(),
                track_index: 0,
                language: "eng".to_string(),
                title: None,
                codec: Some("webvtt".to_string()),
                is_default: true,
                is_forced: false,
                is_hearing_impaired: false,
                handle: "200/file-sub".to_string(),
                account_id: "primary".to_string(),
            })
            .unwrap();

        let handles = store.delete_video("gone").unwrap().unwrap();
        assert_eq!(handles.len(), 2);
        assert!(store.video_by_id("gone").unwrap().is_none());
        assert!(store.segments_for_video("gone").unwrap().is_empty());
        assert!(store.subtitles_for_video("gone").unwrap().is_empty());
        // second delete: video is gone
        assert!(store.delete_video("gone").unwrap().is_none());
    }

    #[test]
    fn listing_filters_by_status() {
        let (_temp, store) = test_store();
        store.insert_video(&VideoRecord::new("a", "a.mp4")).unwrap();
        store.insert_video(&VideoRecord::new("b", "b.mp4")).unwrap();
        store.insert_segment(&sample_segment("b", 0)).unwrap();
        store.finalize_video("b", 6.0, 1, 4_000_000).unwrap();

        let active = store.list_videos(Some(VideoStatus::Active), 10, 0).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "b");
        let all = store.list_videos(None, 10, 0).unwrap();
        assert_eq!(all.len(), 2);
        let counts = store.count_by_status().unwrap();
        assert_eq!(counts.get("processing"), Some(&1));
        assert_eq!(counts.get("active"), Some(&1));
    }

    #[test]
    fn metrics_aggregate_segment_bytes() {
        let (_temp, store) = test_store();
        store.insert_video(&VideoRecord::new("m", "m.mp4")).unwrap();
        store.insert_segment(&sample_segment("m", 0)).unwrap();
        store.insert_segment(&sample_segment("m", 1)).unwrap();
        let metrics = store.compute_metrics().unwrap();
        assert_eq!(metrics.videos, 1);
        assert_eq!(metrics.segments, 2);
        assert_eq!(metrics.total_bytes, 8_000_000);
    }
}
