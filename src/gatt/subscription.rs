//! Subscriptions to a peer's notifications and indications
//!
//! Several handlers may subscribe to one characteristic. The CCC on the
//! server always holds the union of what the handlers asked for, and is
//! only rewritten when that union changes.

use heapless::Vec;

use super::Gatt;
use crate::att::AttPdu;
use crate::connection::{ConnId, Connection, ConnectionInfo};
use crate::constants::MAX_SUBSCRIPTIONS;
use crate::host::Stack;
use crate::{Address, Error, IterAction};

/// Receives notifications and indications of a subscribed value
pub trait NotificationHandler {
    /// A value arrived, or `None` once the subscription has ended
    ///
    /// Returning [`IterAction::Stop`] ends the subscription.
    fn notified(&self, conn: &ConnectionInfo, value_handle: u16, value: Option<&[u8]>)
    -> IterAction;
}

/// Which characteristic to subscribe to, and how
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubscribeParams {
    /// Characteristic value notified
    pub value_handle: u16,
    /// Its Client Characteristic Configuration descriptor
    pub ccc_handle: u16,
    /// [`CCC_NOTIFY`](super::CCC_NOTIFY) and/or
    /// [`CCC_INDICATE`](super::CCC_INDICATE)
    pub value: u16,
}

#[derive(Clone, Copy)]
pub(crate) struct Subscription<'d> {
    peer: Address,
    value_handle: u16,
    ccc_handle: u16,
    bits: u16,
    handler: &'d dyn NotificationHandler,
}

impl Subscription<'_> {
    fn is(&self, peer: &Address, ccc_handle: u16, handler: &dyn NotificationHandler) -> bool {
        self.peer == *peer
            && self.ccc_handle == ccc_handle
            && core::ptr::addr_eq(self.handler, handler)
    }
}

type Subscriptions<'d> = Vec<Subscription<'d>, MAX_SUBSCRIPTIONS>;

/// CCC bits all handlers of `peer` want in `ccc_handle`
fn union(subs: &Subscriptions<'_>, peer: &Address, ccc_handle: u16) -> u16 {
    subs.iter()
        .filter(|s| s.peer == *peer && s.ccc_handle == ccc_handle)
        .fold(0, |bits, s| bits | s.bits)
}

impl<'d> Gatt<'d> {
    /// Remove the subscription of `handler`, returning the CCC union before
    /// and after, or `None` if it was not subscribed
    fn remove_subscription(
        &self,
        peer: &Address,
        ccc_handle: u16,
        handler: &dyn NotificationHandler,
    ) -> Option<(u16, u16)> {
        self.subscriptions.lock(|subs| {
            let mut subs = subs.borrow_mut();
            let before = union(&subs, peer, ccc_handle);
            let pos = subs.iter().position(|s| s.is(peer, ccc_handle, handler))?;
            subs.remove(pos);
            Some((before, union(&subs, peer, ccc_handle)))
        })
    }
}

impl<'d> Stack<'d> {
    /// Subscribe `handler` to a characteristic of the peer's server
    ///
    /// The CCC is written only when `params.value` asks for something no
    /// other handler has enabled yet.
    ///
    /// # Errors
    /// * `Error::InvalidParameter` for a zero handle or empty `value`
    /// * `Error::Already` if `handler` is subscribed to this CCC already
    /// * `Error::NoResources` when the subscription list is full
    /// * errors of [`Stack::gatt_write`] from writing the CCC; the
    ///   subscription is dropped then
    pub async fn gatt_subscribe(
        &self,
        conn: &Connection<'_>,
        params: &SubscribeParams,
        handler: &'d dyn NotificationHandler,
    ) -> Result<(), Error> {
        if params.value_handle == 0 || params.ccc_handle == 0 || params.value == 0 {
            return Err(Error::InvalidParameter);
        }
        let peer = conn.peer();
        let before = self.gatt.subscriptions.lock(|subs| {
            let mut subs = subs.borrow_mut();
            if subs.iter().any(|s| s.is(&peer, params.ccc_handle, handler)) {
                return Err(Error::Already);
            }
            let before = union(&subs, &peer, params.ccc_handle);
            subs.push(Subscription {
                peer,
                value_handle: params.value_handle,
                ccc_handle: params.ccc_handle,
                bits: params.value,
                handler,
            })
            .map_err(|_| Error::NoResources)?;
            Ok(before)
        })?;

        if before & params.value == params.value {
            debug!("[GATT] CCC {:#x} already covers {:#x}", params.ccc_handle, params.value);
            return Ok(());
        }
        let value = before | params.value;
        if let Err(e) = self
            .gatt_write(conn, params.ccc_handle, &value.to_le_bytes())
            .await
        {
            warn!("[GATT] CCC {:#x} write failed: {:?}", params.ccc_handle, e);
            self.gatt
                .remove_subscription(&peer, params.ccc_handle, handler);
            return Err(e);
        }
        Ok(())
    }

    /// Withdraw `params.value` from the subscription of `handler`
    ///
    /// Once no bits remain the subscription ends and `handler` gets `None`.
    /// The CCC is rewritten if the union of all handlers changed.
    ///
    /// # Errors
    /// * `Error::NotFound` if `handler` is not subscribed to this CCC
    /// * errors of [`Stack::gatt_write`] from rewriting the CCC
    pub async fn gatt_unsubscribe(
        &self,
        conn: &Connection<'_>,
        params: &SubscribeParams,
        handler: &'d dyn NotificationHandler,
    ) -> Result<(), Error> {
        let info = self.conn_info(conn.id()).ok_or(Error::NotConnected)?;
        let peer = info.peer;
        let (before, after, ended) = self.gatt.subscriptions.lock(|subs| {
            let mut subs = subs.borrow_mut();
            let before = union(&subs, &peer, params.ccc_handle);
            let pos = subs
                .iter()
                .position(|s| s.is(&peer, params.ccc_handle, handler))
                .ok_or(Error::NotFound)?;
            subs[pos].bits &= !params.value;
            let ended = if subs[pos].bits == 0 {
                Some(subs.remove(pos))
            } else {
                None
            };
            Ok::<_, Error>((before, union(&subs, &peer, params.ccc_handle), ended))
        })?;

        if let Some(sub) = ended {
            sub.handler.notified(&info, sub.value_handle, None);
        }
        if after != before {
            self.gatt_write(conn, params.ccc_handle, &after.to_le_bytes())
                .await?;
        }
        Ok(())
    }

    /// Deliver a notification or indication value to its subscribers
    pub(crate) async fn gatt_notification(
        &self,
        id: ConnId,
        info: &ConnectionInfo,
        value_handle: u16,
        value: &[u8],
    ) {
        // handlers run without the list locked, in subscription order
        let matching: Subscriptions<'d> = self.gatt.subscriptions.lock(|subs| {
            subs.borrow()
                .iter()
                .filter(|s| s.peer == info.peer && s.value_handle == value_handle)
                .copied()
                .collect()
        });
        if matching.is_empty() {
            debug!("[GATT] unsubscribed value {:#x} from {:?}", value_handle, info.peer);
            return;
        }

        for sub in &matching {
            if sub.handler.notified(info, value_handle, Some(value)) == IterAction::Continue {
                continue;
            }
            let Some((before, after)) =
                self.gatt
                    .remove_subscription(&info.peer, sub.ccc_handle, sub.handler)
            else {
                continue;
            };
            sub.handler.notified(info, value_handle, None);
            if after != before {
                let write = AttPdu::WriteCmd {
                    handle: sub.ccc_handle,
                    value: &after.to_le_bytes(),
                };
                if let Err(e) = self.att_send(id, &write).await {
                    warn!("[GATT] CCC {:#x} not rewritten: {:?}", sub.ccc_handle, e);
                }
            }
        }
    }

    /// Fail GATT operations of a link that went down
    ///
    /// Subscriptions and CCC values of a peer without a bond end with it.
    pub(crate) fn gatt_disconnected(&self, id: ConnId, info: &ConnectionInfo) {
        self.gatt.abort_client(id, Error::Disconnected);
        self.gatt.abort_indication(id, Error::Disconnected);
        self.gatt.drop_prepared(id);
        if self.security().is_bonded(&info.peer) {
            return;
        }

        let ended: Subscriptions<'d> = self.gatt.subscriptions.lock(|subs| {
            let mut subs = subs.borrow_mut();
            let mut ended = Vec::new();
            while let Some(i) = subs.iter().position(|s| s.peer == info.peer) {
                // same capacity as the list
                let _ = ended.push(subs.remove(i));
            }
            ended
        });
        for sub in &ended {
            sub.handler.notified(info, sub.value_handle, None);
        }
        self.gatt.clear_ccc(&info.peer);
    }
}
