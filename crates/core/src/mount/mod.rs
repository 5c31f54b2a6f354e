//! Published paths and the registry that owns them.
//!
//! A [`Mount`] is created by a publisher's ANNOUNCE and holds one
//! [`RtspStream`] per media line of the announced SDP. [`Mounts`] maps URI
//! paths to mounts and owns the server's [`PortPool`].

pub mod hooks;
pub mod stream;

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::client::Client;
use crate::error::{Result, RtspError};
use crate::pool::PortPool;
use crate::protocol::sdp;
use crate::session::new_id;

pub use hooks::{Authenticator, Hooks, MountCheck, MountEvents};
pub use stream::{RtspStream, StreamPorts};

/// Mount path and media-line index addressed by an RTSP URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub path: String,
    pub stream_id: u32,
}

impl MountInfo {
    /// Split a request URI into the mount path and the stream index.
    ///
    /// `rtsp://host:554/live/cam1/trackID=1` → `/live/cam1`, stream 1.
    /// A URI without a `streamid=N`, `trackID=N` or `trackN` segment addresses
    /// stream 0.
    pub fn from_uri(uri: &str) -> Self {
        let path = match uri.split_once("://") {
            Some((_, rest)) => rest.find('/').map_or("/", |slash| &rest[slash..]),
            None => uri,
        };
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let path = path.trim_end_matches('/');

        let (base, stream_id) = match path.rsplit_once('/') {
            Some((base, last)) => match stream_index(last) {
                Some(id) => (base, id),
                None => (path, 0),
            },
            None => (path, 0),
        };

        let path = if base.is_empty() {
            "/".to_string()
        } else if base.starts_with('/') {
            base.to_string()
        } else {
            format!("/{base}")
        };
        Self { path, stream_id }
    }
}

fn stream_index(segment: &str) -> Option<u32> {
    let lower = segment.to_ascii_lowercase();
    let digits = lower
        .strip_prefix("streamid=")
        .or_else(|| lower.strip_prefix("trackid="))
        .or_else(|| lower.strip_prefix("track"))?;
    digits.parse().ok()
}

/// What happens to an existing mount when its path is announced again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AnnouncePolicy {
    /// Close the previous mount: its subscribers are torn down and every
    /// port it held goes back to the pool.
    #[default]
    TeardownPrevious,
    /// Stop only the previous publisher relay. Subscriber sessions stay
    /// registered until TEARDOWN or keepalive expiry closes them.
    OrphanSubscribers,
}

/// Lifecycle of a mount: `Announced → Recording → TornDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Announced,
    Recording,
    TornDown,
}

/// Registry of published mounts, keyed by path.
///
/// Cloning is cheap; clones share the same map and pool.
#[derive(Clone)]
pub struct Mounts {
    mounts: Arc<RwLock<HashMap<String, Arc<Mount>>>>,
    pool: PortPool,
    bind_ip: IpAddr,
    policy: AnnouncePolicy,
}

impl Mounts {
    pub fn new(pool: PortPool) -> Self {
        Self {
            mounts: Arc::new(RwLock::new(HashMap::new())),
            pool,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            policy: AnnouncePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: AnnouncePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// IP every relay socket (publisher and subscriber side) binds on.
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn pool(&self) -> &PortPool {
        &self.pool
    }

    /// Register a mount for the path of `uri`, with one stream per `m=` line
    /// of `sdp`.
    ///
    /// An existing mount at the same path is replaced and then handled
    /// according to the registry's [`AnnouncePolicy`].
    pub async fn add_mount(&self, uri: &str, sdp: &str, hooks: Hooks) -> Arc<Mount> {
        let path = MountInfo::from_uri(uri).path;
        let mount = Arc::new(Mount::new(&path, sdp, self.pool.clone(), self.bind_ip, hooks));

        let previous = self.mounts.write().insert(path.clone(), mount.clone());
        tracing::info!(
            %path,
            mount_id = %mount.id(),
            streams = mount.stream_count(),
            "mount announced"
        );

        if let Some(previous) = previous {
            tracing::warn!(%path, previous_id = %previous.id(), policy = ?self.policy, "mount replaced");
            match self.policy {
                AnnouncePolicy::TeardownPrevious => previous.close().await,
                AnnouncePolicy::OrphanSubscribers => previous.stop_relays().await,
            }
        }
        mount
    }

    /// Look up the mount addressed by `uri` (any stream suffix is ignored).
    pub fn get_mount(&self, uri: &str) -> Option<Arc<Mount>> {
        let path = MountInfo::from_uri(uri).path;
        self.mounts.read().get(&path).cloned()
    }

    /// Unregister the mount addressed by `uri` and close it, returning every
    /// port held by its relays and subscribers.
    pub async fn delete_mount(&self, uri: &str) -> Option<Arc<Mount>> {
        let path = MountInfo::from_uri(uri).path;
        let mount = self.mounts.write().remove(&path)?;
        mount.close().await;
        tracing::info!(%path, mount_id = %mount.id(), "mount deleted");
        Some(mount)
    }

    /// Close and unregister every mount.
    pub async fn close_all(&self) {
        let mounts: Vec<Arc<Mount>> = self.mounts.write().drain().map(|(_, m)| m).collect();
        for mount in mounts {
            mount.close().await;
        }
    }

    pub fn get_next_rtp_port(&self) -> Option<u16> {
        self.pool.get_next_rtp_port()
    }

    pub fn return_rtp_port_to_pool(&self, port: u16) {
        self.pool.return_rtp_port_to_pool(port)
    }

    pub fn mount_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.mounts.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.mounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.read().is_empty()
    }
}

/// One published path.
pub struct Mount {
    id: String,
    path: String,
    sdp: String,
    streams: RwLock<BTreeMap<u32, Arc<RtspStream>>>,
    range: Mutex<Option<String>>,
    state: Mutex<MountState>,
    pool: PortPool,
    bind_ip: IpAddr,
    hooks: Hooks,
}

impl Mount {
    fn new(path: &str, sdp: &str, pool: PortPool, bind_ip: IpAddr, hooks: Hooks) -> Self {
        let streams: BTreeMap<u32, Arc<RtspStream>> = (0u32..)
            .zip(sdp::media_lines(sdp))
            .map(|(id, _)| (id, Arc::new(RtspStream::new(id, path, pool.clone(), bind_ip))))
            .collect();

        Self {
            id: new_id(),
            path: path.to_string(),
            sdp: sdp.to_string(),
            streams: RwLock::new(streams),
            range: Mutex::new(None),
            state: Mutex::new(MountState::Announced),
            pool,
            bind_ip,
            hooks,
        }
    }

    /// Publisher session id, advertised in the ANNOUNCE response.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// SDP body exactly as announced.
    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    pub fn state(&self) -> MountState {
        *self.state.lock()
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub(crate) fn pool(&self) -> &PortPool {
        &self.pool
    }

    pub(crate) fn bind_ip(&self) -> IpAddr {
        self.bind_ip
    }

    pub fn range(&self) -> Option<String> {
        self.range.lock().clone()
    }

    pub fn set_range(&self, range: impl Into<String>) {
        *self.range.lock() = Some(range.into());
    }

    pub fn stream(&self, id: u32) -> Option<Arc<RtspStream>> {
        self.streams.read().get(&id).cloned()
    }

    pub fn stream_ids(&self) -> Vec<u32> {
        self.streams.read().keys().copied().collect()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Bind the publisher-facing sockets for the stream addressed by `uri`
    /// and return the ports the publisher should send to.
    ///
    /// A stream index the SDP did not declare is created on demand. A
    /// repeated call for the same stream returns the same ports.
    pub async fn create_stream(&self, uri: &str) -> Result<StreamPorts> {
        let info = MountInfo::from_uri(uri);
        if info.path != self.path {
            return Err(RtspError::MountMismatch {
                mount: self.path.clone(),
                requested: info.path,
            });
        }
        if self.state() == MountState::TornDown {
            return Err(RtspError::MountNotFound(self.path.clone()));
        }

        let stream = self
            .streams
            .write()
            .entry(info.stream_id)
            .or_insert_with(|| {
                Arc::new(RtspStream::new(
                    info.stream_id,
                    &self.path,
                    self.pool.clone(),
                    self.bind_ip,
                ))
            })
            .clone();

        stream.bind().await
    }

    /// Start relaying every stream (RECORD). Streams whose sockets are not
    /// bound yet are bound first. Calling this again is harmless.
    pub async fn setup(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == MountState::TornDown {
                return Err(RtspError::MountNotFound(self.path.clone()));
            }
            *state = MountState::Recording;
        }

        let streams: Vec<Arc<RtspStream>> = self.streams.read().values().cloned().collect();
        for stream in streams {
            stream.listen().await?;
        }
        tracing::info!(path = %self.path, mount_id = %self.id, "mount recording");
        Ok(())
    }

    /// Remove `client` from the stream that holds it.
    ///
    /// When that leaves the mount without subscribers, the
    /// `mount_now_empty` event fires (unless the mount is being torn down).
    pub fn client_leave(&self, client: &Client) {
        let Some(stream) = self.stream(client.stream_id()) else {
            return;
        };
        if !stream.remove_client(client.id()) {
            return;
        }

        let empty = self.streams.read().values().all(|s| s.client_count() == 0);
        if empty && self.state() != MountState::TornDown {
            tracing::debug!(path = %self.path, "mount has no subscribers");
            if let Some(events) = &self.hooks.events {
                events.mount_now_empty(self);
            }
        }
    }

    /// Stop every publisher relay and return its ports; subscribers stay.
    pub async fn stop_relays(&self) {
        let streams: Vec<Arc<RtspStream>> = self.streams.read().values().cloned().collect();
        for stream in streams {
            stream.stop_relay().await;
        }
    }

    /// Tear the mount down: relays stopped, subscribers closed, ports
    /// returned.
    pub async fn close(&self) {
        *self.state.lock() = MountState::TornDown;
        let streams: Vec<Arc<RtspStream>> = self.streams.read().values().cloned().collect();
        for stream in streams {
            stream.close().await;
        }
        tracing::debug!(path = %self.path, mount_id = %self.id, "mount closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TWO_TRACKS: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=Cam\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=control:streamid=0\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=control:streamid=1\r\n";

    #[test]
    fn mount_info_from_uri() {
        let cases = [
            ("rtsp://h/stream1", "/stream1", 0),
            ("rtsp://h:554/stream1/trackID=0", "/stream1", 0),
            ("rtsp://h/live/cam/streamid=1", "/live/cam", 1),
            ("rtsp://h/stream1/track2", "/stream1", 2),
            ("rtsp://h/stream1/TRACKID=3", "/stream1", 3),
            ("rtsp://h/stream1/", "/stream1", 0),
            ("rtsp://h/stream1?token=abc", "/stream1", 0),
            ("rtsp://h", "/", 0),
            ("/bare/path", "/bare/path", 0),
            ("rtsp://h/tracker", "/tracker", 0),
        ];
        for (uri, path, id) in cases {
            let info = MountInfo::from_uri(uri);
            assert_eq!(info.path, path, "{uri}");
            assert_eq!(info.stream_id, id, "{uri}");
        }
    }

    #[tokio::test]
    async fn add_mount_creates_stream_per_media_line() {
        let mounts = Mounts::new(PortPool::new(46000, 46019));
        let mount = mounts
            .add_mount("rtsp://h/cam", TWO_TRACKS, Hooks::default())
            .await;

        assert_eq!(mount.path(), "/cam");
        assert_eq!(mount.stream_ids(), vec![0, 1]);
        assert_eq!(mount.sdp(), TWO_TRACKS);
        assert_eq!(mount.state(), MountState::Announced);
        assert!(mounts.get_mount("rtsp://h/cam/streamid=1").is_some());
        assert!(mounts.get_mount("rtsp://h/other").is_none());
        assert_eq!(mounts.mount_paths(), vec!["/cam".to_string()]);
    }

    #[tokio::test]
    async fn create_stream_and_setup() {
        let mounts = Mounts::new(PortPool::new(46020, 46039));
        let mount = mounts
            .add_mount("rtsp://h/cam", TWO_TRACKS, Hooks::default())
            .await;

        let video = mount.create_stream("rtsp://h/cam/streamid=0").await.unwrap();
        let again = mount.create_stream("rtsp://h/cam/streamid=0").await.unwrap();
        assert_eq!(video, again);
        assert_eq!(video.rtp_end_port, video.rtp_start_port + 1);
        assert_eq!(mounts.pool().leased_count(), 1);

        let err = mount.create_stream("rtsp://h/other/streamid=0").await.unwrap_err();
        assert!(matches!(err, RtspError::MountMismatch { .. }));

        // audio was never set up by the publisher; RECORD binds it anyway
        mount.setup().await.unwrap();
        mount.setup().await.unwrap();
        assert_eq!(mount.state(), MountState::Recording);
        assert_eq!(mounts.pool().leased_count(), 2);
        assert!(mount.stream(1).unwrap().ports().is_some());
    }

    #[tokio::test]
    async fn create_stream_beyond_sdp_lines() {
        let mounts = Mounts::new(PortPool::new(46040, 46059));
        let mount = mounts.add_mount("rtsp://h/raw", "v=0\r\n", Hooks::default()).await;
        assert_eq!(mount.stream_count(), 0);

        mount.create_stream("rtsp://h/raw/trackID=0").await.unwrap();
        assert_eq!(mount.stream_ids(), vec![0]);
    }

    #[tokio::test]
    async fn delete_mount_returns_ports() {
        let mounts = Mounts::new(PortPool::new(46060, 46079));
        let mount = mounts
            .add_mount("rtsp://h/cam", TWO_TRACKS, Hooks::default())
            .await;
        mount.setup().await.unwrap();
        assert_eq!(mounts.pool().leased_count(), 2);

        assert!(mounts.delete_mount("rtsp://h/cam").await.is_some());
        assert!(mounts.delete_mount("rtsp://h/cam").await.is_none());
        assert_eq!(mounts.pool().leased_count(), 0);
        assert_eq!(mount.state(), MountState::TornDown);
        assert!(mounts.is_empty());
        assert!(mount.create_stream("rtsp://h/cam").await.is_err());
    }

    #[tokio::test]
    async fn reannounce_tears_down_previous() {
        let mounts = Mounts::new(PortPool::new(46080, 46099));
        let first = mounts
            .add_mount("rtsp://h/cam", TWO_TRACKS, Hooks::default())
            .await;
        first.setup().await.unwrap();

        let second = mounts
            .add_mount("rtsp://h/cam", TWO_TRACKS, Hooks::default())
            .await;
        assert_ne!(first.id(), second.id());
        assert_eq!(first.state(), MountState::TornDown);
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts.pool().leased_count(), 0);
        assert!(Arc::ptr_eq(&mounts.get_mount("rtsp://h/cam").unwrap(), &second));
    }

    #[tokio::test]
    async fn reannounce_orphan_policy_keeps_previous_open() {
        let mounts = Mounts::new(PortPool::new(46100, 46119)).with_policy(AnnouncePolicy::OrphanSubscribers);
        let first = mounts
            .add_mount("rtsp://h/cam", TWO_TRACKS, Hooks::default())
            .await;
        first.setup().await.unwrap();

        mounts
            .add_mount("rtsp://h/cam", TWO_TRACKS, Hooks::default())
            .await;
        assert_eq!(first.state(), MountState::Recording);
        assert_eq!(mounts.pool().leased_count(), 0);
    }

    struct CountEmpty(AtomicUsize);

    impl MountEvents for CountEmpty {
        fn mount_now_empty(&self, _mount: &Mount) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn last_client_leaving_fires_event() {
        let events = Arc::new(CountEmpty(AtomicUsize::new(0)));
        let hooks = Hooks {
            events: Some(events.clone()),
            ..Hooks::default()
        };
        let mounts = Mounts::new(PortPool::new(46120, 46139));
        let mount = mounts.add_mount("rtsp://h/cam", TWO_TRACKS, hooks).await;

        let mut clients = Vec::new();
        for track in ["streamid=0", "streamid=1"] {
            let raw = format!(
                "SETUP rtsp://h/cam/{track} RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n"
            );
            let req = crate::protocol::RtspRequest::parse(&raw)
                .unwrap()
                .with_peer_addr("127.0.0.1:40000".parse().unwrap());
            let client = Arc::new(Client::new(&mount, &req).unwrap());
            client.play();
            clients.push(client);
        }

        clients[0].close().await;
        assert_eq!(events.0.load(Ordering::SeqCst), 0);
        clients[1].close().await;
        assert_eq!(events.0.load(Ordering::SeqCst), 1);
        clients[1].close().await;
        assert_eq!(events.0.load(Ordering::SeqCst), 1);
    }
}
