//! The metadata object sent alongside every description and candidate.
//!
//! The client supplies free-form fields and a `tracks` array mapping mids to
//! application track ids. The device echoes the client's fields back, keeps
//! `tracks` current and adds a connection-wide `status`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::media::{MediaTrack, TrackError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaTrack {
    #[serde(default)]
    pub mid: String,
    #[serde(rename = "trackId", default)]
    pub track_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionMetadata {
    fields: Map<String, Value>,
    tracks: Vec<MetaTrack>,
    failed: bool,
}

impl ConnectionMetadata {
    /// Take over the fields of a client-sent metadata object. Tracks are
    /// merged by mid. Returns the client's `noTrickle` flag when present.
    pub fn merge_remote(&mut self, remote: &Value) -> Option<bool> {
        let object = remote.as_object()?;
        for (key, value) in object {
            match key.as_str() {
                "tracks" => self.merge_tracks(value),
                "status" => {}
                _ => {
                    self.fields.insert(key.clone(), value.clone());
                }
            }
        }
        object.get("noTrickle").and_then(Value::as_bool)
    }

    fn merge_tracks(&mut self, value: &Value) {
        let Some(entries) = value.as_array() else {
            tracing::debug!("metadata tracks is not an array");
            return;
        };
        for entry in entries {
            let Ok(remote) = serde_json::from_value::<MetaTrack>(entry.clone()) else {
                tracing::debug!(%entry, "skipping malformed metadata track");
                continue;
            };
            match self.tracks.iter_mut().find(|track| track.mid == remote.mid) {
                Some(track) => track.track_id = remote.track_id,
                None => self.tracks.push(MetaTrack {
                    error: None,
                    ..remote
                }),
            }
        }
    }

    pub fn track_id_for(&self, mid: &str) -> Option<&str> {
        self.tracks
            .iter()
            .find(|track| track.mid == mid)
            .map(|track| track.track_id.as_str())
    }

    pub fn push_track(&mut self, mid: Option<String>, track_id: &str) {
        self.tracks.push(MetaTrack {
            mid: mid.unwrap_or_default(),
            track_id: track_id.to_owned(),
            error: None,
        });
    }

    /// Bring every entry up to date with the tracks the connection holds:
    /// mids as negotiated so far, per-track errors, and the overall status.
    pub fn refresh(&mut self, tracks: &[MediaTrack]) {
        self.failed = false;
        let claimed: Vec<String> = tracks.iter().filter_map(MediaTrack::mid).collect();
        for track in tracks {
            let mid = track.mid().unwrap_or_default();
            let error = track.error_state();
            // An entry whose mid no track holds any more (e.g. the fragment's
            // own mid before the peer assigned one) follows its track id.
            let index = self
                .tracks
                .iter()
                .position(|entry| !mid.is_empty() && entry.mid == mid)
                .or_else(|| {
                    self.tracks.iter().position(|entry| {
                        !track.track_id().is_empty()
                            && entry.track_id == track.track_id()
                            && (entry.mid.is_empty() || !claimed.contains(&entry.mid))
                    })
                });
            let entry = match index {
                Some(index) => &mut self.tracks[index],
                None if error.is_ok() => continue,
                None => {
                    self.tracks.push(MetaTrack {
                        mid: mid.clone(),
                        track_id: track.track_id().to_owned(),
                        error: None,
                    });
                    let last = self.tracks.len() - 1;
                    &mut self.tracks[last]
                }
            };
            if !mid.is_empty() {
                entry.mid = mid;
            }
            if error == TrackError::Ok {
                entry.error = None;
            } else {
                entry.error = Some(error.as_str().to_owned());
                self.failed = true;
            }
        }
    }

    pub fn tracks(&self) -> &[MetaTrack] {
        &self.tracks
    }

    pub fn status(&self) -> &'static str {
        if self.failed { "FAILED" } else { "OK" }
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        let tracks = self
            .tracks
            .iter()
            .filter_map(|track| serde_json::to_value(track).ok())
            .collect();
        object.insert("tracks".to_owned(), Value::Array(tracks));
        object.insert("status".to_owned(), Value::from(self.status()));
        Value::Object(object)
    }
}
