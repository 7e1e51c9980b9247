//! Spotify Web API implementation of [`RequestApiChannel`].

use async_trait::async_trait;
use rspotify::http::HttpError;
use rspotify::model::{
    AdditionalType, AlbumId, ArtistId, CurrentlyPlayingContext, PlayContextId, PlayableItem,
    PlaylistId, ShowId,
};
use rspotify::prelude::*;
use rspotify::{AuthCodeSpotify, ClientError, ClientResult, Token};
use runbeat_core::{
    AccessToken, PlaybackDevice, RequestApiChannel, ServiceError, ServiceResult, SnapshotSource,
    TrackSnapshot,
};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const LOG_TARGET: &str = "runbeat::spotify::web_api";

const ADDITIONAL_TYPES: [AdditionalType; 2] = [AdditionalType::Track, AdditionalType::Episode];

/// Request/response channel backed by the rspotify client.
pub struct SpotifyWebApi {
    client: AuthCodeSpotify,
    request_timeout: Duration,
    validation_timeout: Duration,
}

impl SpotifyWebApi {
    #[must_use]
    pub fn new(request_timeout: Duration, validation_timeout: Duration) -> Self {
        Self {
            client: AuthCodeSpotify::from_token(Token::default()),
            request_timeout,
            validation_timeout,
        }
    }

    async fn authorize(&self, token: &AccessToken) -> ServiceResult<&AuthCodeSpotify> {
        let mut guard = self
            .client
            .token
            .lock()
            .await
            .map_err(|_| ServiceError::InvalidResponse {
                reason: "failed to acquire token lock".into(),
            })?;
        let stale = guard
            .as_ref()
            .is_none_or(|current| current.access_token != token.access_token);
        if stale {
            *guard = Some(Token {
                access_token: token.access_token.clone(),
                refresh_token: token.refresh_token.clone(),
                expires_at: Some(token.expires_at),
                ..Token::default()
            });
        }
        Ok(&self.client)
    }

    /// Run a client call under `limit`, classifying failures. `content_uri` names the
    /// content a 404 may refer to.
    async fn call<T>(
        &self,
        limit: Duration,
        content_uri: Option<&str>,
        request: impl Future<Output = ClientResult<T>> + Send,
    ) -> ServiceResult<T> {
        match tokio::time::timeout(limit, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(classify_client_error(err, content_uri).await),
            Err(_) => Err(ServiceError::NetworkTimeout),
        }
    }
}

#[async_trait]
impl RequestApiChannel for SpotifyWebApi {
    async fn currently_playing(&self, token: &AccessToken) -> ServiceResult<Option<TrackSnapshot>> {
        let client = self.authorize(token).await?;
        let request_start = Instant::now();
        let context = self
            .call(
                self.request_timeout,
                None,
                client.current_playing(None, Some(&ADDITIONAL_TYPES)),
            )
            .await?;
        let latency = request_start.elapsed();

        let snapshot = context
            .as_ref()
            .and_then(|context| snapshot_from_context(context, latency));
        debug!(
            target: LOG_TARGET,
            "Currently playing: {:?}",
            snapshot.as_ref().map(|s| &s.name)
        );
        Ok(snapshot)
    }

    async fn play(
        &self,
        token: &AccessToken,
        context_uri: &str,
        device_id: Option<&str>,
    ) -> ServiceResult<()> {
        let context = context_id(context_uri)?;
        let client = self.authorize(token).await?;
        self.call(
            self.request_timeout,
            Some(context_uri),
            client.start_context_playback(context, device_id, None, None),
        )
        .await
    }

    async fn pause(&self, token: &AccessToken, device_id: Option<&str>) -> ServiceResult<()> {
        let client = self.authorize(token).await?;
        self.call(self.request_timeout, None, client.pause_playback(device_id))
            .await
    }

    async fn resume(&self, token: &AccessToken, device_id: Option<&str>) -> ServiceResult<()> {
        let client = self.authorize(token).await?;
        self.call(
            self.request_timeout,
            None,
            client.resume_playback(device_id, None),
        )
        .await
    }

    async fn devices(&self, token: &AccessToken) -> ServiceResult<Vec<PlaybackDevice>> {
        let client = self.authorize(token).await?;
        let devices = self
            .call(self.request_timeout, None, client.device())
            .await?;
        Ok(devices
            .into_iter()
            .filter_map(|device| {
                device.id.map(|id| PlaybackDevice {
                    id,
                    name: device.name,
                    is_active: device.is_active,
                    is_restricted: device.is_restricted,
                })
            })
            .collect())
    }

    async fn transfer_playback(
        &self,
        token: &AccessToken,
        device_id: &str,
        play: bool,
    ) -> ServiceResult<()> {
        let client = self.authorize(token).await?;
        self.call(
            self.request_timeout,
            None,
            client.transfer_playback(device_id, Some(play)),
        )
        .await
    }

    async fn validate_token(&self, token: &AccessToken) -> ServiceResult<()> {
        let client = self.authorize(token).await?;
        self.call(self.validation_timeout, None, client.current_user())
            .await
            .map(|_| ())
    }
}

/// Convert a currently-playing response, compensating the position for half the
/// request latency.
#[must_use]
pub fn snapshot_from_context(
    context: &CurrentlyPlayingContext,
    latency: Duration,
) -> Option<TrackSnapshot> {
    let snapshot = match context.item.as_ref()? {
        PlayableItem::Track(track) => {
            let artists = track
                .artists
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let uri = track.id.as_ref().map(|id| id.uri()).unwrap_or_default();
            let artwork = track
                .album
                .images
                .first()
                .map(|image| image.url.clone())
                .unwrap_or_default();
            TrackSnapshot::new(
                &track.name,
                artists,
                uri,
                track.duration.to_std().unwrap_or(Duration::ZERO),
                SnapshotSource::RequestApi,
            )
            .with_artwork(artwork)
        }
        PlayableItem::Episode(episode) => {
            let artwork = episode
                .images
                .first()
                .map(|image| image.url.clone())
                .unwrap_or_default();
            TrackSnapshot::new(
                &episode.name,
                &episode.show.name,
                episode.id.uri(),
                episode.duration.to_std().unwrap_or(Duration::ZERO),
                SnapshotSource::RequestApi,
            )
            .with_artwork(artwork)
        }
    };

    let position = context.progress.map_or(Duration::ZERO, |p| {
        p.to_std().unwrap_or(Duration::ZERO) + latency / 2
    });

    Some(
        snapshot
            .with_position(position)
            .with_playing(context.is_playing),
    )
}

async fn classify_client_error(err: ClientError, content_uri: Option<&str>) -> ServiceError {
    match err {
        ClientError::Http(http) => match *http {
            HttpError::StatusCode(response) => {
                let status = response.status().as_u16();
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                let body = response.text().await.unwrap_or_default();
                classify_status(status, retry_after, &body, content_uri)
            }
            HttpError::Client(e) if e.is_timeout() => ServiceError::NetworkTimeout,
            HttpError::Client(e) => ServiceError::NetworkUnavailable {
                reason: e.to_string(),
            },
        },
        ClientError::ParseJson(e) => ServiceError::DecodeFailure {
            reason: e.to_string(),
        },
        ClientError::InvalidToken => ServiceError::TokenExpired,
        other => ServiceError::InvalidResponse {
            reason: other.to_string(),
        },
    }
}

/// Map an error status to the taxonomy. A 404 names the device unless the body says
/// otherwise and the request targeted specific content.
#[must_use]
pub fn classify_status(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
    content_uri: Option<&str>,
) -> ServiceError {
    if status == 404 {
        let mentions_device = body.to_ascii_lowercase().contains("device");
        return match content_uri {
            Some(uri) if !mentions_device => ServiceError::ContentNotFound {
                uri: uri.to_string(),
            },
            _ => ServiceError::DeviceNotFound,
        };
    }

    ServiceError::from_status(status, retry_after).unwrap_or(ServiceError::InvalidResponse {
        reason: format!("HTTP {status}: {body}"),
    })
}

/// Parse a playlist, album, artist or show URI into a playback context.
fn context_id(uri: &str) -> ServiceResult<PlayContextId<'_>> {
    PlaylistId::from_uri(uri)
        .map(PlayContextId::Playlist)
        .or_else(|_| AlbumId::from_uri(uri).map(PlayContextId::Album))
        .or_else(|_| ArtistId::from_uri(uri).map(PlayContextId::Artist))
        .or_else(|_| ShowId::from_uri(uri).map(PlayContextId::Show))
        .map_err(|_| ServiceError::ContentNotFound {
            uri: uri.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_id_by_uri_kind() {
        assert_eq!(
            context_id("spotify:playlist:37i9dQZF1DXcBWIGoYBM5M").unwrap(),
            PlayContextId::Playlist(PlaylistId::from_id("37i9dQZF1DXcBWIGoYBM5M").unwrap())
        );
        assert_eq!(
            context_id("spotify:album:4aawyAB9vmqN3uQ7FjRGTy").unwrap(),
            PlayContextId::Album(AlbumId::from_id("4aawyAB9vmqN3uQ7FjRGTy").unwrap())
        );
    }

    #[test]
    fn test_context_id_rejects_non_contexts() {
        for uri in ["spotify:track:6rqhFgbbKwnb9MLmUQDhG6", "not a uri", ""] {
            assert_eq!(
                context_id(uri),
                Err(ServiceError::ContentNotFound { uri: uri.into() })
            );
        }
    }

    #[test]
    fn test_not_found_device_vs_content() {
        let body = r#"{"error":{"status":404,"message":"Player command failed: No active device found"}}"#;
        assert_eq!(
            classify_status(404, None, body, Some("spotify:playlist:abc")),
            ServiceError::DeviceNotFound
        );

        let body = r#"{"error":{"status":404,"message":"Not found."}}"#;
        assert_eq!(
            classify_status(404, None, body, Some("spotify:playlist:abc")),
            ServiceError::ContentNotFound {
                uri: "spotify:playlist:abc".into()
            }
        );
        assert_eq!(
            classify_status(404, None, body, None),
            ServiceError::DeviceNotFound
        );
    }

    #[test]
    fn test_other_statuses() {
        assert_eq!(
            classify_status(429, Some(Duration::from_secs(3)), "", None),
            ServiceError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert_eq!(
            classify_status(401, None, "", None),
            ServiceError::TokenExpired
        );
        assert_eq!(
            classify_status(502, None, "", None),
            ServiceError::ServiceUnavailable
        );
    }
}
