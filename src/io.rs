//! Attribute I/O coordinator.
//!
//! All request/response traffic for a connection funnels through here:
//! reads, writes, subscription descriptor writes, and MTU negotiation.
//! The connection's fair operation lock serializes callers (FIFO, no
//! pipelining) and the single pending slot enforces the one-request-
//! in-flight transport invariant. A request that sees no driver
//! response within `request_timeout` is retried exactly once, then
//! fails with `RequestTimeout`.

use tokio::sync::oneshot;

use crate::connection::Connection;
use crate::driver::{CharacteristicInfo, DescriptorInfo, DriverEvent, ServiceInfo};
use crate::error::CentralError;
use crate::notify::Notifications;
use crate::types::Handle;

/// CCCD values for subscription control.
const ENABLE_NOTIFICATIONS: [u8; 2] = [0x01, 0x00];
const ENABLE_INDICATIONS: [u8; 2] = [0x02, 0x00];
const DISABLE_NOTIFICATIONS: [u8; 2] = [0x00, 0x00];

/// What kind of request occupies the pending slot, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Read,
    Write,
    SubscribeEnable,
    SubscribeDisable,
    Discovery,
    Mtu,
}

/// The driver event the pending request is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Expect {
    Services,
    Characteristics { service: uuid::Uuid },
    Descriptors { characteristic: Handle },
    Read { handle: Handle },
    Write { handle: Handle },
    Mtu,
}

/// Payload delivered through a fulfilled pending slot.
#[derive(Debug)]
pub(crate) enum Outcome {
    Services(Vec<ServiceInfo>),
    Characteristics(Vec<CharacteristicInfo>),
    Descriptors(Vec<DescriptorInfo>),
    Value(Vec<u8>),
    Done,
    Mtu(u16),
}

/// The one in-flight request of a connection.
pub(crate) struct Pending {
    pub(crate) kind: RequestKind,
    pub(crate) expect: Expect,
    tx: oneshot::Sender<Result<Outcome, CentralError>>,
}

impl Pending {
    pub(crate) fn fail(self, err: CentralError) {
        let _ = self.tx.send(Err(err));
    }
}

fn protocol_violation() -> CentralError {
    CentralError::DriverUnavailable("driver response did not match the pending request".into())
}

impl Connection {
    /// Install the pending slot for a request about to be issued.
    /// Callers hold the operation lock, so the slot is free except
    /// when a late response raced a timed-out request.
    pub(crate) async fn arm(
        &self,
        kind: RequestKind,
        expect: Expect,
    ) -> oneshot::Receiver<Result<Outcome, CentralError>> {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.pending.lock().await;
        if let Some(stale) = slot.replace(Pending { kind, expect, tx }) {
            log::warn!(
                "replacing stale pending {:?} request for {}",
                stale.kind,
                self.peer
            );
            stale.fail(CentralError::RequestTimeout);
        }
        rx
    }

    pub(crate) async fn disarm(&self) {
        self.pending.lock().await.take();
    }

    /// Resolve the pending slot with a routed driver event. Events that
    /// do not match the armed expectation leave the slot in place.
    pub(crate) async fn complete_pending(&self, event: DriverEvent) {
        let mut slot = self.pending.lock().await;
        let Some(pending) = slot.take() else {
            log::debug!("unsolicited driver event for {}: {:?}", self.peer, event);
            return;
        };
        let outcome = match (pending.expect.clone(), event) {
            (Expect::Services, DriverEvent::ServicesDiscovered { services, .. }) => {
                Ok(Outcome::Services(services))
            }
            (
                Expect::Characteristics { service },
                DriverEvent::CharacteristicsDiscovered {
                    service: got,
                    characteristics,
                    ..
                },
            ) if service == got => Ok(Outcome::Characteristics(characteristics)),
            (
                Expect::Descriptors { characteristic },
                DriverEvent::DescriptorsDiscovered {
                    characteristic: got,
                    descriptors,
                    ..
                },
            ) if characteristic == got => Ok(Outcome::Descriptors(descriptors)),
            (
                Expect::Read { handle },
                DriverEvent::AttributeReadCompleted {
                    handle: got,
                    value,
                    ok,
                    ..
                },
            ) if handle == got => {
                if ok {
                    Ok(Outcome::Value(value))
                } else {
                    Err(CentralError::RequestFailed { handle: got })
                }
            }
            (
                Expect::Write { handle },
                DriverEvent::AttributeWriteCompleted {
                    handle: got, ok, ..
                },
            ) if handle == got => {
                if ok {
                    Ok(Outcome::Done)
                } else {
                    Err(CentralError::RequestFailed { handle: got })
                }
            }
            (Expect::Mtu, DriverEvent::MtuChanged { mtu, .. }) => Ok(Outcome::Mtu(mtu)),
            (_, event) => {
                log::debug!(
                    "event does not match pending {:?} request for {}; dropped: {:?}",
                    pending.kind,
                    self.peer,
                    event
                );
                *slot = Some(pending);
                return;
            }
        };
        let _ = pending.tx.send(outcome);
    }

    /// Await the armed response with the configured timeout. On
    /// timeout the slot is cleared so a late response cannot leak into
    /// the next request.
    pub(crate) async fn await_response(
        &self,
        rx: oneshot::Receiver<Result<Outcome, CentralError>>,
    ) -> Result<Outcome, CentralError> {
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err(CentralError::NotConnected),
            Err(_elapsed) => {
                self.disarm().await;
                Err(CentralError::RequestTimeout)
            }
        }
    }

    /// Read a characteristic value.
    pub async fn read(&self, handle: Handle) -> Result<Vec<u8>, CentralError> {
        let _op = self.op_lock.lock().await;
        self.ensure_connected()?;
        self.require_characteristic(handle).await?;
        let mut retried = false;
        loop {
            let rx = self.arm(RequestKind::Read, Expect::Read { handle }).await;
            if let Err(e) = self.driver.read_attribute(&self.peer, handle).await {
                self.disarm().await;
                return Err(e);
            }
            match self.await_response(rx).await {
                Ok(Outcome::Value(value)) => return Ok(value),
                Ok(_) => return Err(protocol_violation()),
                Err(CentralError::RequestTimeout) if !retried => {
                    retried = true;
                    log::debug!(
                        "read on {} for {} timed out; retrying once",
                        handle,
                        self.peer
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write a characteristic value.
    ///
    /// With `require_ack` the call waits for the peer's acknowledgment
    /// under the read timeout/retry policy; without it the call
    /// returns as soon as the driver accepts the send.
    pub async fn write(
        &self,
        handle: Handle,
        value: &[u8],
        require_ack: bool,
    ) -> Result<(), CentralError> {
        let _op = self.op_lock.lock().await;
        self.ensure_connected()?;
        self.require_characteristic(handle).await?;
        if require_ack {
            self.ack_write(handle, value, RequestKind::Write).await
        } else {
            self.driver
                .write_attribute(&self.peer, handle, value, false)
                .await
        }
    }

    /// Write, choosing the mode from the characteristic's properties:
    /// with-response whenever the peripheral supports it, without only
    /// when that is the sole supported mode.
    pub async fn write_preferred(
        &self,
        handle: Handle,
        value: &[u8],
    ) -> Result<(), CentralError> {
        let properties = {
            let table = self.table.lock().await;
            table
                .as_ref()
                .and_then(|t| t.characteristic(handle))
                .map(|c| c.properties)
        }
        .ok_or(CentralError::CharacteristicNotFound(handle))?;
        let with_response =
            properties.can_write() || !properties.can_write_without_response();
        self.write(handle, value, with_response).await
    }

    /// Subscribe to value changes of a notifiable characteristic.
    pub async fn subscribe(&self, handle: Handle) -> Result<Notifications, CentralError> {
        let _op = self.op_lock.lock().await;
        self.ensure_connected()?;
        let (cccd, enable) = {
            let table = self.table.lock().await;
            let characteristic = table
                .as_ref()
                .and_then(|t| t.characteristic(handle))
                .ok_or(CentralError::CharacteristicNotFound(handle))?;
            let cccd = characteristic
                .cccd
                .ok_or(CentralError::CharacteristicNotFound(handle))?;
            let enable = if characteristic.properties.can_notify() {
                ENABLE_NOTIFICATIONS
            } else {
                ENABLE_INDICATIONS
            };
            (cccd, enable)
        };
        // Register with the router before the enable write completes:
        // a notification racing the acknowledgment must not be lost.
        let stream = self.router.register(handle).await;
        if let Err(e) = self
            .ack_write(cccd, &enable, RequestKind::SubscribeEnable)
            .await
        {
            let _ = self.router.unregister(handle, stream.id()).await;
            return Err(e);
        }
        Ok(stream)
    }

    /// Drop a subscription. The configuration descriptor is disabled
    /// on the peripheral only when the last consumer for the handle
    /// unregisters.
    pub async fn unsubscribe(&self, stream: Notifications) -> Result<(), CentralError> {
        let _op = self.op_lock.lock().await;
        let handle = stream.handle();
        let (removed, now_empty) = self.router.unregister(handle, stream.id()).await;
        if !removed || !now_empty {
            return Ok(());
        }
        if !self.is_connected() {
            // Subscriptions were already released with the link.
            return Ok(());
        }
        let cccd = {
            let table = self.table.lock().await;
            table
                .as_ref()
                .and_then(|t| t.characteristic(handle))
                .and_then(|c| c.cccd)
        };
        match cccd {
            Some(cccd) => {
                self.ack_write(cccd, &DISABLE_NOTIFICATIONS, RequestKind::SubscribeDisable)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Negotiate the MTU. Returns the value the driver reports back,
    /// which also becomes [`Connection::mtu`](crate::Connection::mtu).
    pub async fn request_mtu(&self, size: u16) -> Result<u16, CentralError> {
        let _op = self.op_lock.lock().await;
        self.ensure_connected()?;
        let rx = self.arm(RequestKind::Mtu, Expect::Mtu).await;
        if let Err(e) = self.driver.request_mtu(&self.peer, size).await {
            self.disarm().await;
            return Err(e);
        }
        match self.await_response(rx).await? {
            Outcome::Mtu(mtu) => Ok(mtu),
            _ => Err(protocol_violation()),
        }
    }

    /// Acknowledged write with the shared timeout/retry policy. The
    /// caller holds the operation lock.
    pub(crate) async fn ack_write(
        &self,
        handle: Handle,
        value: &[u8],
        kind: RequestKind,
    ) -> Result<(), CentralError> {
        let mut retried = false;
        loop {
            let rx = self.arm(kind, Expect::Write { handle }).await;
            if let Err(e) = self
                .driver
                .write_attribute(&self.peer, handle, value, true)
                .await
            {
                self.disarm().await;
                return Err(e);
            }
            match self.await_response(rx).await {
                Ok(Outcome::Done) => return Ok(()),
                Ok(_) => return Err(protocol_violation()),
                Err(CentralError::RequestTimeout) if !retried => {
                    retried = true;
                    log::debug!(
                        "{:?} write on {} for {} timed out; retrying once",
                        kind,
                        handle,
                        self.peer
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn require_characteristic(&self, handle: Handle) -> Result<(), CentralError> {
        let table = self.table.lock().await;
        match table.as_ref().and_then(|t| t.characteristic(handle)) {
            Some(_) => Ok(()),
            None => Err(CentralError::CharacteristicNotFound(handle)),
        }
    }
}
