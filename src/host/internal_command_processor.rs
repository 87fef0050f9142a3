use bt_hci::cmd::le::{
    LeLongTermKeyRequestNegativeReply, LeLongTermKeyRequestReply, LeReadRemoteFeatures,
    LeRemoteConnectionParameterRequestNegativeReply, LeRemoteConnectionParameterRequestReply,
};
use bt_hci::cmd::link_control::{
    AcceptConnectionRequest, IoCapabilityRequestNegativeReply, LinkKeyRequestNegativeReply,
    LinkKeyRequestReply, PinCodeRequestNegativeReply, UserConfirmationRequestNegativeReply,
};
use bt_hci::param::{RemoteConnectionParamsRejectReason, Role as HciRole};

use super::{InternalCommand, Stack};
use crate::hci::{Status, handle, status, units};

impl Stack<'_> {
    /// Run one follow-up command queued by an event handler
    pub(crate) async fn process_internal_command(&self, command: InternalCommand) {
        let (what, result) = match command {
            // no role switch on incoming BR/EDR links
            InternalCommand::AcceptConnection { bd_addr } => (
                "Accept Connection Request",
                self.exec(&AcceptConnectionRequest::new(bd_addr, HciRole::Peripheral))
                    .await
                    .map(drop),
            ),
            InternalCommand::LinkKeyReply { bd_addr, key } => (
                "Link Key Request Reply",
                self.exec(&LinkKeyRequestReply::new(bd_addr, key))
                    .await
                    .map(drop),
            ),
            InternalCommand::LinkKeyNegativeReply { bd_addr } => (
                "Link Key Request Negative Reply",
                self.exec(&LinkKeyRequestNegativeReply::new(bd_addr))
                    .await
                    .map(drop),
            ),
            InternalCommand::PinCodeNegativeReply { bd_addr } => (
                "PIN Code Request Negative Reply",
                self.exec(&PinCodeRequestNegativeReply::new(bd_addr))
                    .await
                    .map(drop),
            ),
            InternalCommand::IoCapabilityNegativeReply { bd_addr } => (
                "IO Capability Request Negative Reply",
                self.exec(&IoCapabilityRequestNegativeReply::new(
                    bd_addr,
                    Status::new(status::PAIRING_NOT_ALLOWED),
                ))
                .await
                .map(drop),
            ),
            InternalCommand::UserConfirmationNegativeReply { bd_addr } => (
                "User Confirmation Request Negative Reply",
                self.exec(&UserConfirmationRequestNegativeReply::new(bd_addr))
                    .await
                    .map(drop),
            ),
            InternalCommand::LtkReply { handle: conn, ltk } => (
                "LE Long Term Key Request Reply",
                self.exec(&LeLongTermKeyRequestReply::new(handle(conn), ltk))
                    .await
                    .map(drop),
            ),
            InternalCommand::LtkNegativeReply { handle: conn } => (
                "LE Long Term Key Request Negative Reply",
                self.exec(&LeLongTermKeyRequestNegativeReply::new(handle(conn)))
                    .await
                    .map(drop),
            ),
            InternalCommand::ConnParamReply {
                handle: conn,
                params,
            } => (
                "LE Remote Connection Parameter Request Reply",
                self.exec(&LeRemoteConnectionParameterRequestReply::new(
                    handle(conn),
                    units(params.interval_min),
                    units(params.interval_max),
                    params.latency,
                    units(params.timeout),
                    units(0),
                    units(0),
                ))
                .await
                .map(drop),
            ),
            InternalCommand::ConnParamNegativeReply { handle: conn } => (
                "LE Remote Connection Parameter Request Negative Reply",
                self.exec(&LeRemoteConnectionParameterRequestNegativeReply::new(
                    handle(conn),
                    RemoteConnectionParamsRejectReason::UnacceptableConnParameters,
                ))
                .await
                .map(drop),
            ),
            InternalCommand::ConnUpdate { handle, params } => (
                "LE Connection Update",
                self.le_conn_update(handle, &params).await,
            ),
            InternalCommand::ReadRemoteFeatures { handle: conn } => (
                "LE Read Remote Features",
                self.exec(&LeReadRemoteFeatures::new(handle(conn)))
                    .await
                    .map(drop),
            ),
            InternalCommand::UpdateConnParams { id } => {
                self.update_conn_params(id).await;
                return;
            }
            InternalCommand::ScanUpdate { fast } => ("scan update", self.scan_update(fast).await),
            InternalCommand::CreateConnection { id } => {
                ("LE Create Connection", self.create_le_connection(id).await)
            }
            InternalCommand::ReenableAdvertising => {
                ("advertising restart", self.reenable_advertising().await)
            }
        };

        match result {
            Ok(()) => debug!("[HOST] {} done", what),
            Err(e) => warn!("[HOST] {} failed: {:?}", what, e),
        }
    }
}
