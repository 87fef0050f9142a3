//! Connection entry points of the [`Stack`]
//!
//! Outgoing LE links go through the background scan described in
//! [`gap`](crate::gap): [`Stack::connect`] returns at once with a handle in
//! `ConnectScan`, and [`Connection::wait_connected`] resolves when the link
//! comes up or the attempt fails.
//!
//! # Usage
//!
//! ```rust,ignore
//! let conn = stack.connect(&peer, &stack.config().conn_params).await?;
//! conn.wait_connected().await?;
//! stack.gatt_exchange_mtu(&conn).await?;
//! stack.disconnect(&conn, DisconnectReason::RemoteUserTerminatedConn).await?;
//! ```

use bt_hci::cmd::le::LeCreateConnCancel;
use bt_hci::cmd::link_control::Disconnect;
use bt_hci::param::DisconnectReason;

use crate::connection::{ConnParams, Connection, ConnectionState, LinkKind, Role};
use crate::hci::{handle, status};
use crate::host::Stack;
use crate::{Address, Error};

impl Stack<'_> {
    /// Connect to an LE peer
    ///
    /// A link that is already pending or up is returned as is; a pending
    /// attempt gets `params` for the eventual connection.
    ///
    /// # Errors
    /// * [`Error::InvalidParameter`] if `params` is out of range
    /// * [`Error::InvalidState`] while an explicit scan runs, or if the peer's
    ///   slot is tearing down
    /// * [`Error::NoResources`] if the connection table is full
    pub async fn connect(
        &self,
        peer: &Address,
        params: &ConnParams,
    ) -> Result<Connection<'_>, Error> {
        if !params.is_valid() {
            return Err(Error::InvalidParameter);
        }
        if self.gap.explicit_scan() {
            return Err(Error::InvalidState);
        }

        if let Some(id) = self.connections.find_by_addr(peer) {
            return match self.connections.state(id) {
                ConnectionState::ConnectScan => {
                    self.connections.set_params(id, *params);
                    self.connections.connection(id).ok_or(Error::NotFound)
                }
                ConnectionState::Connecting | ConnectionState::Connected => {
                    self.connections.connection(id).ok_or(Error::NotFound)
                }
                _ => Err(Error::InvalidState),
            };
        }

        let id = self
            .connections
            .alloc(*peer, LinkKind::Le, Role::Central, *params)?;
        let conn = self.connections.connection(id).ok_or(Error::NotFound)?;
        self.connections.set_state(id, ConnectionState::ConnectScan);
        info!("[HOST] connecting to {:?}", peer);
        self.scan_update(true).await?;
        Ok(conn)
    }

    /// Keep reconnecting to `peer` whenever its link is down
    ///
    /// # Errors
    /// [`Error::NoResources`] if the connection table is full, [`Error::Hci`]
    /// if the background scan could not be reconfigured
    pub async fn set_auto_connect(&self, peer: &Address, enable: bool) -> Result<(), Error> {
        let id = match self.connections.find_by_addr(peer) {
            Some(id) => id,
            None if enable => {
                self.connections
                    .alloc(*peer, LinkKind::Le, Role::Central, self.config.conn_params)?
            }
            None => return Ok(()),
        };

        let was_enabled = self.connections.set_auto_connect(id, enable);
        let state = self.connections.state(id);
        debug!("[HOST] auto-connect {} for {:?} in {:?}", enable, peer, state);
        match state {
            ConnectionState::Disconnected if enable => {
                self.connections.set_state(id, ConnectionState::ConnectScan);
            }
            ConnectionState::ConnectScan if !enable && was_enabled => {
                self.connections.set_state(id, ConnectionState::Disconnected);
                self.connections.release(id);
            }
            _ => return Ok(()),
        }
        self.scan_update(false).await
    }

    /// Tear down a link, or abandon a pending attempt
    ///
    /// Auto-connect for the peer is switched off. The link is gone once
    /// [`Connection::wait_disconnected`] returns. `reason` goes to the peer;
    /// an attempt abandoned before the controller was involved ends with
    /// Connection Terminated By Local Host.
    ///
    /// # Errors
    /// * [`Error::NotConnected`] if there is nothing to tear down
    /// * [`Error::Hci`] if the controller rejects the command
    pub async fn disconnect(
        &self,
        conn: &Connection<'_>,
        reason: DisconnectReason,
    ) -> Result<(), Error> {
        let id = conn.id();
        self.connections.set_auto_connect(id, false);

        match self.connections.state(id) {
            ConnectionState::ConnectScan => {
                self.connections
                    .update(id, |info| info.reason = status::LOCAL_HOST_TERM_CONN);
                self.connections.set_state(id, ConnectionState::Disconnected);
                self.connections.release(id);
                self.scan_update(false).await
            }
            ConnectionState::Connecting => {
                self.exec(&LeCreateConnCancel::new()).await.map(drop)
            }
            ConnectionState::Connected => {
                let conn_handle = conn.handle();
                self.exec(&Disconnect::new(handle(conn_handle), reason))
                    .await?;
                self.connections
                    .set_state(id, ConnectionState::Disconnecting);
                info!("[HOST] disconnecting handle {:#x}", conn_handle);
                Ok(())
            }
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                Err(Error::NotConnected)
            }
        }
    }

    /// Ask for new parameters on an LE link
    ///
    /// As central the controller runs the update; as peripheral the request
    /// goes to the central over the L2CAP signaling channel.
    ///
    /// # Errors
    /// * [`Error::InvalidParameter`] if `params` is out of range
    /// * [`Error::NotConnected`] unless the link is an established LE link
    /// * [`Error::Already`] if the link already runs with these parameters
    pub async fn update_le_params(
        &self,
        conn: &Connection<'_>,
        params: &ConnParams,
    ) -> Result<(), Error> {
        if !params.is_valid() {
            return Err(Error::InvalidParameter);
        }
        let info = conn.info();
        if info.state != ConnectionState::Connected || info.kind != LinkKind::Le {
            return Err(Error::NotConnected);
        }
        if (params.interval_min..=params.interval_max).contains(&info.interval)
            && info.latency == params.latency
            && info.timeout == params.timeout
        {
            return Err(Error::Already);
        }

        self.connections.set_params(conn.id(), *params);
        match info.role {
            Role::Central => self.le_conn_update(info.handle, params).await,
            Role::Peripheral => self.l2cap_conn_param_request(conn.id(), params).await,
        }
    }

    /// Send an L2CAP Connection Parameter Update Request to the central
    ///
    /// # Errors
    /// * [`Error::InvalidParameter`] if `params` is out of range
    /// * [`Error::NotConnected`] unless the link is an established LE link
    /// * [`Error::InvalidState`] if we are the central
    pub async fn request_conn_param_update(
        &self,
        conn: &Connection<'_>,
        params: &ConnParams,
    ) -> Result<(), Error> {
        if !params.is_valid() {
            return Err(Error::InvalidParameter);
        }
        let info = conn.info();
        if info.state != ConnectionState::Connected || info.kind != LinkKind::Le {
            return Err(Error::NotConnected);
        }
        if info.role != Role::Peripheral {
            return Err(Error::InvalidState);
        }
        self.connections.set_params(conn.id(), *params);
        self.l2cap_conn_param_request(conn.id(), params).await
    }
}
