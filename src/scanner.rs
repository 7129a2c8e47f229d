//! Scanner engine.
//!
//! A connection-independent state machine over the radio's single scan
//! session. Sightings are deduplicated per peer, last write wins, with
//! no merging of fields across sightings. A live feed can be attached
//! for push delivery; stopping the scan ends the feed as a normal end
//! of sequence.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::driver::RadioDriver;
use crate::error::CentralError;
use crate::types::{AdvertisementSighting, PeerAddress};

/// Limits which sightings are stored and forwarded. An empty filter
/// matches everything.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    service_uuids: BTreeSet<Uuid>,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.insert(uuid);
        self
    }

    pub fn matches(&self, sighting: &AdvertisementSighting) -> bool {
        self.service_uuids.is_empty()
            || sighting
                .service_uuids
                .iter()
                .any(|u| self.service_uuids.contains(u))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    Idle,
    Scanning,
}

struct ScanInner {
    phase: ScanPhase,
    sightings: HashMap<PeerAddress, AdvertisementSighting>,
    live: Option<mpsc::UnboundedSender<AdvertisementSighting>>,
    filter: ScanFilter,
}

/// Discovery-mode engine over the radio's one scan session.
pub struct Scanner {
    driver: Arc<dyn RadioDriver>,
    /// Session flag and sighting map are guarded as one unit.
    inner: Mutex<ScanInner>,
}

impl Scanner {
    pub(crate) fn new(driver: Arc<dyn RadioDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            inner: Mutex::new(ScanInner {
                phase: ScanPhase::Idle,
                sightings: HashMap::new(),
                live: None,
                filter: ScanFilter::default(),
            }),
        })
    }

    /// Set the filter applied to subsequent sightings.
    pub async fn set_filter(&self, filter: ScanFilter) {
        self.inner.lock().await.filter = filter;
    }

    /// Start a scan session, clearing previously stored sightings.
    pub async fn start(&self) -> Result<(), CentralError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.phase == ScanPhase::Scanning {
                return Err(CentralError::AlreadyScanning);
            }
            inner.phase = ScanPhase::Scanning;
            inner.sightings.clear();
        }
        if let Err(e) = self.driver.start_scan().await {
            self.inner.lock().await.phase = ScanPhase::Idle;
            return Err(e);
        }
        log::debug!("scan session started");
        Ok(())
    }

    /// Attach a live sighting feed, replacing any prior consumer. The
    /// feed ends when the scan stops.
    pub async fn stream(&self) -> mpsc::UnboundedReceiver<AdvertisementSighting> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().await.live = Some(tx);
        rx
    }

    /// Stop the scan session and return the accumulated sightings.
    /// Idempotent: stopping an idle scanner returns the retained map
    /// without touching the driver.
    pub async fn stop(
        &self,
    ) -> Result<HashMap<PeerAddress, AdvertisementSighting>, CentralError> {
        let was_scanning = {
            let mut inner = self.inner.lock().await;
            let was = inner.phase == ScanPhase::Scanning;
            inner.phase = ScanPhase::Idle;
            // Dropping the sender ends the live feed gracefully.
            inner.live = None;
            was
        };
        if was_scanning {
            self.driver.stop_scan().await?;
            log::debug!("scan session stopped");
        }
        Ok(self.inner.lock().await.sightings.clone())
    }

    /// Scan for a fixed duration and return what was seen.
    pub async fn discover(
        &self,
        duration: Duration,
    ) -> Result<HashMap<PeerAddress, AdvertisementSighting>, CentralError> {
        self.start().await?;
        tokio::time::sleep(duration).await;
        self.stop().await
    }

    /// Snapshot of the stored sightings.
    pub async fn sightings(&self) -> HashMap<PeerAddress, AdvertisementSighting> {
        self.inner.lock().await.sightings.clone()
    }

    /// Addresses seen so far.
    pub async fn discovered(&self) -> Vec<PeerAddress> {
        self.inner.lock().await.sightings.keys().cloned().collect()
    }

    pub async fn is_scanning(&self) -> bool {
        self.inner.lock().await.phase == ScanPhase::Scanning
    }

    /// Scan until a peer with the given address is sighted.
    pub async fn find_by_address(
        &self,
        peer: &PeerAddress,
        timeout: Duration,
    ) -> Result<AdvertisementSighting, CentralError> {
        let wanted = peer.clone();
        self.find_where(&peer.to_string(), timeout, move |s| s.peer == wanted)
            .await
    }

    /// Scan until a peer advertising the given local name is sighted.
    pub async fn find_by_name(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<AdvertisementSighting, CentralError> {
        let wanted = name.to_string();
        self.find_where(name, timeout, move |s| {
            s.local_name.as_deref() == Some(wanted.as_str())
        })
        .await
    }

    async fn find_where<F>(
        &self,
        description: &str,
        timeout: Duration,
        predicate: F,
    ) -> Result<AdvertisementSighting, CentralError>
    where
        F: Fn(&AdvertisementSighting) -> bool,
    {
        self.start().await?;
        let mut feed = self.stream().await;
        // A sighting may have landed between start and feed attach.
        let already_stored = self
            .inner
            .lock()
            .await
            .sightings
            .values()
            .find(|s| predicate(s))
            .cloned();
        if let Some(sighting) = already_stored {
            let _ = self.stop().await;
            return Ok(sighting);
        }
        let found = tokio::time::timeout(timeout, async {
            loop {
                match feed.recv().await {
                    Some(s) if predicate(&s) => break Some(s),
                    Some(_) => continue,
                    None => break None,
                }
            }
        })
        .await
        .ok()
        .flatten();
        let _ = self.stop().await;
        found.ok_or_else(|| CentralError::DeviceNotFound(description.to_string()))
    }

    /// Take in one sighting from the event pump. Sightings outside a
    /// session and sightings rejected by the filter are dropped.
    pub(crate) async fn ingest(&self, sighting: AdvertisementSighting) {
        let mut inner = self.inner.lock().await;
        if inner.phase != ScanPhase::Scanning {
            log::debug!("sighting from {} outside a scan session; dropped", sighting.peer);
            return;
        }
        if !inner.filter.matches(&sighting) {
            return;
        }
        if let Some(live) = &inner.live {
            if live.send(sighting.clone()).is_err() {
                inner.live = None;
            }
        }
        inner.sightings.insert(sighting.peer.clone(), sighting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::SimRadio;
    use crate::types::uuid16;

    fn sighting(last_byte: u8, rssi: i16) -> AdvertisementSighting {
        AdvertisementSighting::new(PeerAddress::Public([0, 0, 0, 0, 0, last_byte]), rssi)
    }

    async fn scanner() -> (Arc<SimRadio>, Arc<Scanner>) {
        let (radio, _events) = SimRadio::new();
        let scanner = Scanner::new(Arc::clone(&radio) as Arc<dyn RadioDriver>);
        (radio, scanner)
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let (_radio, scanner) = scanner().await;
        scanner.start().await.expect("first start");
        assert_eq!(scanner.start().await, Err(CentralError::AlreadyScanning));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_reports_driver_state() {
        let (radio, scanner) = scanner().await;
        scanner.start().await.expect("start");
        assert!(radio.is_scanning().await);

        scanner.stop().await.expect("stop");
        assert!(!radio.is_scanning().await);

        // Second stop touches nothing.
        let commands_before = radio.commands().await.len();
        scanner.stop().await.expect("idle stop");
        assert_eq!(radio.commands().await.len(), commands_before);
    }

    #[tokio::test]
    async fn test_last_sighting_wins_per_peer() {
        let (_radio, scanner) = scanner().await;
        scanner.start().await.expect("start");

        scanner.ingest(sighting(1, -70)).await;
        scanner.ingest(sighting(1, -40)).await;
        scanner.ingest(sighting(2, -55)).await;

        let map = scanner.stop().await.expect("stop");
        assert_eq!(map.len(), 2);
        let stored = &map[&PeerAddress::Public([0, 0, 0, 0, 0, 1])];
        assert_eq!(stored.rssi, -40);
    }

    #[tokio::test]
    async fn test_start_clears_prior_sightings() {
        let (_radio, scanner) = scanner().await;
        scanner.start().await.expect("start");
        scanner.ingest(sighting(1, -50)).await;
        scanner.stop().await.expect("stop");

        scanner.start().await.expect("restart");
        assert!(scanner.sightings().await.is_empty());
    }

    #[tokio::test]
    async fn test_sightings_outside_session_are_dropped() {
        let (_radio, scanner) = scanner().await;
        scanner.ingest(sighting(1, -50)).await;
        assert!(scanner.sightings().await.is_empty());
    }

    #[tokio::test]
    async fn test_filter_drops_non_matching() {
        let (_radio, scanner) = scanner().await;
        let wanted = uuid16(0x180F);
        scanner.set_filter(ScanFilter::new().with_service(wanted)).await;
        scanner.start().await.expect("start");

        scanner.ingest(sighting(1, -50)).await;
        scanner.ingest(sighting(2, -50).advertising(wanted)).await;

        let map = scanner.stop().await.expect("stop");
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&PeerAddress::Public([0, 0, 0, 0, 0, 2])));
    }

    #[tokio::test]
    async fn test_live_feed_receives_and_ends_on_stop() {
        let (_radio, scanner) = scanner().await;
        scanner.start().await.expect("start");
        let mut feed = scanner.stream().await;

        scanner.ingest(sighting(1, -50)).await;
        let pushed = feed.recv().await.expect("live sighting");
        assert_eq!(pushed.peer, PeerAddress::Public([0, 0, 0, 0, 0, 1]));

        scanner.stop().await.expect("stop");
        assert!(feed.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_runs_for_duration() {
        let (_radio, scanner) = scanner().await;
        let emitter = Arc::clone(&scanner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            emitter.ingest(sighting(7, -33)).await;
        });

        let map = scanner
            .discover(Duration::from_secs(1))
            .await
            .expect("discover");
        assert_eq!(map.len(), 1);
        assert!(!scanner.is_scanning().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_by_address_resolves_and_times_out() {
        let (_radio, scanner) = scanner().await;
        let target = PeerAddress::Public([0, 0, 0, 0, 0, 9]);

        let emitter = Arc::clone(&scanner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            emitter
                .ingest(AdvertisementSighting::new(
                    PeerAddress::Public([0, 0, 0, 0, 0, 9]),
                    -42,
                ))
                .await;
        });
        let found = scanner
            .find_by_address(&target, Duration::from_secs(5))
            .await
            .expect("found");
        assert_eq!(found.peer, target);

        let missing = PeerAddress::Public([1, 1, 1, 1, 1, 1]);
        assert!(matches!(
            scanner.find_by_address(&missing, Duration::from_secs(1)).await,
            Err(CentralError::DeviceNotFound(_))
        ));
    }
}
