//! Listener role: answer "fetch the current frame" requests.
//!
//! The listener owns the capture producer, the shared stream settings and
//! the accepting endpoint. Every per-request failure is isolated: it is
//! logged and answered with the empty "no data" response, and the process
//! keeps serving.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use iroh::endpoint::{Connection, Endpoint};
use iroh::PublicKey;
use tokio_util::sync::CancellationToken;

use crate::net::{self, AllowList};
use crate::producer::{FrameProducer, SourceOpener};
use crate::proto::{self, FrameRequest};

/// Minimum spacing between reachability announcements.
pub const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on "wait for the producer's first frame".
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on "wait for a frame fresher than the slot".
const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Mutable encoding defaults shared by all requests.
///
/// A value provided in a request becomes the new default for subsequent
/// requests from any client; omitted fields fall back to the current
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// JPEG quality, 0-100.
    pub quality: u8,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            quality: 35,
            width: 1280,
            height: 720,
        }
    }
}

impl StreamSettings {
    /// Fold a request's overrides into the settings and return the
    /// effective values for this request.
    ///
    /// Invalid overrides are rejected before anything is mutated, so a bad
    /// request cannot poison the defaults.
    pub fn apply(&mut self, req: &FrameRequest) -> Result<StreamSettings> {
        if let Some(q) = req.quality {
            if q > 100 {
                anyhow::bail!("Quality {} out of range (0-100)", q);
            }
        }
        if req.width == Some(0) || req.height == Some(0) {
            anyhow::bail!("Zero output dimension requested");
        }

        if let Some(q) = req.quality {
            tracing::debug!("Setting quality to {}", q);
            self.quality = q;
        }
        if let Some(w) = req.width {
            tracing::debug!("Setting width to {}", w);
            self.width = w;
        }
        if let Some(h) = req.height {
            tracing::debug!("Setting height to {}", h);
            self.height = h;
        }
        Ok(*self)
    }
}

/// Configuration for [`Listener::bind`].
pub struct ListenerConfig {
    /// Directory holding the `identity` key file.
    pub config_dir: PathBuf,
    /// Capture device index.
    pub camera_index: u32,
    /// Identities allowed to fetch frames. Empty = allow everyone.
    pub allowed: Vec<PublicKey>,
    /// Reachability announce interval (clamped to >= 60s). None = announce
    /// only once at startup.
    pub announce_interval: Option<Duration>,
    /// Initial encoding defaults.
    pub settings: StreamSettings,
    /// Bound on waiting for the producer's first frame.
    pub ready_timeout: Duration,
    /// Bound on waiting for a fresh frame.
    pub frame_timeout: Duration,
}

impl ListenerConfig {
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            config_dir,
            camera_index: 0,
            allowed: Vec::new(),
            announce_interval: None,
            settings: StreamSettings::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
        }
    }
}

/// Shared state a request handler needs, cloneable into connection tasks.
#[derive(Clone)]
struct RequestContext {
    producer: Arc<FrameProducer>,
    settings: Arc<Mutex<StreamSettings>>,
    ready_timeout: Duration,
    frame_timeout: Duration,
}

impl RequestContext {
    /// Produce the encoded response for one request.
    ///
    /// Lazily starts the producer (reopening the device if the capture
    /// thread died), waits for readiness, then takes a frame published
    /// strictly after this request arrived, so the caller never sees a
    /// stale or uninitialized frame.
    async fn produce_frame(&self, req: &FrameRequest) -> Result<Vec<u8>> {
        let effective = self.settings.lock().unwrap().apply(req)?;

        let slot = self.producer.ensure_started();
        let before = slot.sequence();
        slot.wait_ready(self.ready_timeout).await?;

        let frame = slot.next_frame(before, self.frame_timeout).await?;
        let resized = frame.resized(effective.width, effective.height)?;
        resized.to_jpeg(effective.quality)
    }
}

/// A running listener process: one capture producer, one accepting
/// endpoint.
pub struct Listener {
    endpoint: Endpoint,
    ctx: RequestContext,
    allow: AllowList,
    announce_interval: Option<Duration>,
}

impl Listener {
    /// Bind a listener that captures from the local camera.
    #[cfg(feature = "camera")]
    pub async fn bind(config: ListenerConfig) -> Result<Self> {
        let index = config.camera_index;
        let width = config.settings.width;
        let height = config.settings.height;
        let opener: SourceOpener = Box::new(move || {
            let camera = crate::camera::Camera::open(index, width, height)?;
            Ok(Box::new(camera) as Box<dyn crate::producer::FrameSource>)
        });
        Self::bind_with_source(config, opener).await
    }

    /// Bind a listener with an arbitrary frame source.
    pub async fn bind_with_source(config: ListenerConfig, opener: SourceOpener) -> Result<Self> {
        let secret_key = net::load_or_create_identity(&config.config_dir)?;
        let endpoint = net::bind_listener(secret_key).await?;

        Ok(Self {
            endpoint,
            ctx: RequestContext {
                producer: Arc::new(FrameProducer::new(opener)),
                settings: Arc::new(Mutex::new(config.settings)),
                ready_timeout: config.ready_timeout,
                frame_timeout: config.frame_timeout,
            },
            allow: AllowList::new(config.allowed),
            announce_interval: config.announce_interval.map(|iv| iv.max(MIN_ANNOUNCE_INTERVAL)),
        })
    }

    /// This listener's endpoint identity (share with fetchers).
    pub fn endpoint_id(&self) -> PublicKey {
        self.endpoint.secret_key().public()
    }

    /// Effective announce interval after clamping.
    pub fn announce_interval(&self) -> Option<Duration> {
        self.announce_interval
    }

    /// The underlying endpoint. Useful for direct addressing in
    /// integration tests.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Log current reachability. Discovery republish is handled by the
    /// overlay network itself; this re-surfaces the id for operators.
    pub fn announce(&self) {
        tracing::info!("Listening on {}", self.endpoint_id());
    }

    /// Accept and serve connections until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.announce();

        let mut announce_tick = self.announce_interval.map(|iv| {
            tokio::time::interval_at(tokio::time::Instant::now() + iv, iv)
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.endpoint.close().await;
                    return Ok(());
                }
                _ = tick(&mut announce_tick) => {
                    self.announce();
                }
                conn = net::accept(&self.endpoint) => {
                    let Some(conn) = conn else {
                        anyhow::bail!("Endpoint closed");
                    };
                    self.dispatch(conn, cancel.child_token());
                }
            }
        }
    }

    fn dispatch(&self, conn: Connection, cancel: CancellationToken) {
        let remote = conn.remote_id();

        if !self.allow.permits(&remote) {
            tracing::warn!("Rejecting {}: not on allow list", remote);
            conn.close(1u32.into(), b"not allowed");
            return;
        }

        tracing::info!("Client connected: {}", remote);
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(conn, ctx, cancel).await {
                tracing::debug!("Connection ended: {}", e);
            }
            tracing::info!("Client disconnected: {}", remote);
        });
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Serve requests on one connection, one bidirectional stream each, until
/// the client goes away or the listener shuts down.
async fn handle_connection(
    conn: Connection,
    ctx: RequestContext,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => {
                conn.close(0u32.into(), b"shutting down");
                return Ok(());
            }
            result = conn.accept_bi() => result,
        };

        let (mut send, mut recv) = match stream {
            Ok(s) => s,
            Err(e) => {
                // Normal teardown when the client closes the session.
                return Err(e.into());
            }
        };

        let req = match FrameRequest::read_from(&mut recv).await {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("Malformed request: {}", e);
                proto::write_response(&mut send, &[]).await.ok();
                send.finish().ok();
                continue;
            }
        };

        match ctx.produce_frame(&req).await {
            Ok(jpeg) => {
                tracing::info!("Returning {} byte image", jpeg.len());
                proto::write_response(&mut send, &jpeg).await?;
            }
            Err(e) => {
                tracing::error!("Error while updating frame: {}", e);
                proto::write_response(&mut send, &[]).await?;
            }
        }
        send.finish()?;
    }
}
