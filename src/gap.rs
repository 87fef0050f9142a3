//! GAP: advertising, scanning and background connection establishment
//!
//! Outgoing LE connections are created lazily. [`Stack::connect`] parks the
//! target in `ConnectScan` and starts a passive background scan; the first
//! connectable advertisement from the target stops the scan and issues LE
//! Create Connection. An explicit scan started with [`Stack::start_scan`]
//! takes precedence and suspends the background scan until it is stopped.
//!
//! [`Stack::connect`]: crate::Stack::connect

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::connection::{ConnId, ConnectionState};
use crate::constants::{
    GAP_SCAN_FAST_INTERVAL, GAP_SCAN_FAST_WINDOW, GAP_SCAN_SLOW_INTERVAL, GAP_SCAN_SLOW_WINDOW,
    MAX_AD_LEN,
};
use bt_hci::cmd::le::{
    LeCreateConn, LeSetAdvData, LeSetAdvEnable, LeSetAdvParams, LeSetScanEnable, LeSetScanParams,
    LeSetScanResponseData,
};
use bt_hci::param::{
    AdvChannelMap, AdvFilterPolicy, AdvKind, LeAdvEventKind, LeScanKind, ScanningFilterPolicy,
};

use crate::hci::{status, units};
use crate::host::{InternalCommand, Stack};
use crate::{AddrKind, Address, BdAddr, Error};

type CS = CriticalSectionRawMutex;

const ADV_INTERVAL_MIN: u16 = 0x0020;
const ADV_INTERVAL_MAX: u16 = 0x4000;
// Scannable and non-connectable advertising may not go faster than 100 ms
const ADV_NONCONN_INTERVAL_MIN: u16 = 0x00A0;

const SCAN_INTERVAL_MIN: u16 = 0x0004;
const SCAN_INTERVAL_MAX: u16 = 0x4000;

/// AD type codes (Core Specification Supplement, Part A §1)
pub mod ad_type {
    /// Flags
    pub const FLAGS: u8 = 0x01;
    /// Incomplete list of 16-bit service UUIDs
    pub const UUID16_SOME: u8 = 0x02;
    /// Complete list of 16-bit service UUIDs
    pub const UUID16_ALL: u8 = 0x03;
    /// Complete list of 128-bit service UUIDs
    pub const UUID128_ALL: u8 = 0x07;
    /// Shortened local name
    pub const NAME_SHORTENED: u8 = 0x08;
    /// Complete local name
    pub const NAME_COMPLETE: u8 = 0x09;
    /// TX power level
    pub const TX_POWER: u8 = 0x0A;
    /// Manufacturer specific data
    pub const MANUFACTURER_DATA: u8 = 0xFF;
}

/// Bits of the [`ad_type::FLAGS`] structure
pub mod ad_flags {
    /// LE limited discoverable mode
    pub const LE_LIMITED: u8 = 0x01;
    /// LE general discoverable mode
    pub const LE_GENERAL: u8 = 0x02;
    /// BR/EDR not supported
    pub const NO_BREDR: u8 = 0x04;
}

/// One AD structure: type code and payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdStructure<'a> {
    /// AD type, see [`ad_type`]
    pub kind: u8,
    /// Payload without the length and type bytes
    pub data: &'a [u8],
}

impl<'a> AdStructure<'a> {
    /// Create an AD structure
    #[must_use]
    pub const fn new(kind: u8, data: &'a [u8]) -> Self {
        Self { kind, data }
    }

    /// Split advertising or scan response data into its structures
    ///
    /// Iteration ends at the first zero length byte or at a structure that
    /// runs past the end of `data`.
    pub fn parse(data: &'a [u8]) -> impl Iterator<Item = AdStructure<'a>> + 'a {
        let mut rest = data;
        core::iter::from_fn(move || {
            let (&len, tail) = rest.split_first()?;
            let len = usize::from(len);
            if len == 0 || len > tail.len() {
                rest = &[];
                return None;
            }
            let (body, next) = tail.split_at(len);
            rest = next;
            Some(AdStructure::new(body[0], &body[1..]))
        })
    }
}

/// Pack AD structures into the fixed 31-byte HCI field
fn encode_ad(ad: &[AdStructure<'_>]) -> Result<(u8, [u8; MAX_AD_LEN]), Error> {
    let mut out = [0u8; MAX_AD_LEN];
    let mut len = 0;
    for s in ad {
        let end = len + 2 + s.data.len();
        if end > MAX_AD_LEN {
            return Err(Error::InvalidParameter);
        }
        out[len] = u8::try_from(s.data.len() + 1).map_err(|_| Error::InvalidParameter)?;
        out[len + 1] = s.kind;
        out[len + 2..end].copy_from_slice(s.data);
        len = end;
    }
    let len = u8::try_from(len).map_err(|_| Error::InvalidParameter)?;
    Ok((len, out))
}

/// Legacy advertising PDU type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvType {
    /// `ADV_IND`: connectable and scannable
    #[default]
    ConnectableUndirected,
    /// `ADV_SCAN_IND`: scannable, not connectable
    ScannableUndirected,
    /// `ADV_NONCONN_IND`: neither
    NonConnectable,
}

impl AdvType {
    const fn to_hci(self) -> AdvKind {
        match self {
            Self::ConnectableUndirected => AdvKind::AdvInd,
            Self::ScannableUndirected => AdvKind::AdvScanInd,
            Self::NonConnectable => AdvKind::AdvNonconnInd,
        }
    }
}

/// Advertising parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvParams {
    /// PDU type
    pub kind: AdvType,
    /// Minimum interval (N * 0.625 ms)
    pub interval_min: u16,
    /// Maximum interval (N * 0.625 ms)
    pub interval_max: u16,
}

impl AdvParams {
    /// Connectable advertising at 1 s - 1.28 s
    #[must_use]
    pub const fn connectable() -> Self {
        Self {
            kind: AdvType::ConnectableUndirected,
            interval_min: 0x0640,
            interval_max: 0x0800,
        }
    }

    /// Same parameters with another PDU type
    #[must_use]
    pub const fn with_kind(mut self, kind: AdvType) -> Self {
        self.kind = kind;
        self
    }

    /// Same parameters with another interval range
    #[must_use]
    pub const fn with_interval(mut self, min: u16, max: u16) -> Self {
        self.interval_min = min;
        self.interval_max = max;
        self
    }

    fn is_valid(&self) -> bool {
        if self.interval_min > self.interval_max
            || self.interval_min < ADV_INTERVAL_MIN
            || self.interval_max > ADV_INTERVAL_MAX
        {
            return false;
        }
        self.kind == AdvType::ConnectableUndirected
            || self.interval_min >= ADV_NONCONN_INTERVAL_MIN
    }
}

impl Default for AdvParams {
    fn default() -> Self {
        Self::connectable()
    }
}

/// Passive or active scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScanType {
    /// Listen only
    #[default]
    Passive,
    /// Send scan requests to scannable advertisers
    Active,
}

/// Scan parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanParams {
    /// Passive or active
    pub kind: ScanType,
    /// Let the controller drop duplicate reports
    pub filter_duplicates: bool,
    /// Interval (N * 0.625 ms)
    pub interval: u16,
    /// Window (N * 0.625 ms), at most `interval`
    pub window: u16,
}

impl ScanParams {
    /// Active scan at the fast background interval
    #[must_use]
    pub const fn active() -> Self {
        Self {
            kind: ScanType::Active,
            filter_duplicates: true,
            interval: GAP_SCAN_FAST_INTERVAL,
            window: GAP_SCAN_FAST_WINDOW,
        }
    }

    /// Passive scan at the fast background interval
    #[must_use]
    pub const fn passive() -> Self {
        Self {
            kind: ScanType::Passive,
            ..Self::active()
        }
    }

    fn is_valid(&self) -> bool {
        let range = SCAN_INTERVAL_MIN..=SCAN_INTERVAL_MAX;
        range.contains(&self.interval) && range.contains(&self.window) && self.window <= self.interval
    }
}

impl Default for ScanParams {
    fn default() -> Self {
        Self::active()
    }
}

/// One advertisement or scan response seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvReport<'a> {
    /// PDU type
    pub kind: LeAdvEventKind,
    /// Advertiser address
    pub addr: Address,
    /// AD structures, see [`AdStructure::parse`]
    pub data: &'a [u8],
    /// Signal strength in dBm
    pub rssi: i8,
}

impl AdvReport<'_> {
    /// True if the advertiser accepts a connection request
    #[must_use]
    pub fn is_connectable(&self) -> bool {
        matches!(self.kind, LeAdvEventKind::AdvInd | LeAdvEventKind::AdvDirectInd)
    }
}

/// Receives advertising reports during an explicit scan
pub trait ScanHandler {
    /// One advertisement or scan response was received
    fn report(&self, report: &AdvReport<'_>);
}

#[derive(Debug, Clone, Copy, Default)]
struct GapFlags {
    /// Advertising requested by the application
    keep_advertising: bool,
    /// Advertising enabled in the controller
    advertising: bool,
    /// Scanning enabled in the controller
    scanning: bool,
    /// Scan requested by the application
    explicit_scan: bool,
}

/// Advertising and scanning state of the local device
pub(crate) struct Gap<'d> {
    flags: Mutex<CS, Cell<GapFlags>>,
    handler: Mutex<CS, Cell<Option<&'d dyn ScanHandler>>>,
}

impl<'d> Gap<'d> {
    pub(crate) const fn new() -> Self {
        Self {
            flags: Mutex::new(Cell::new(GapFlags {
                keep_advertising: false,
                advertising: false,
                scanning: false,
                explicit_scan: false,
            })),
            handler: Mutex::new(Cell::new(None)),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut GapFlags) -> R) -> R {
        self.flags.lock(|cell| {
            let mut flags = cell.get();
            let r = f(&mut flags);
            cell.set(flags);
            r
        })
    }

    fn get(&self) -> GapFlags {
        self.flags.lock(Cell::get)
    }

    /// The controller stopped advertising because a peripheral link came up
    pub(crate) fn advertising_ended(&self) {
        self.update(|f| f.advertising = false);
    }

    /// Advertising should resume once a link slot frees up
    pub(crate) fn keep_advertising(&self) -> bool {
        self.get().keep_advertising
    }

    pub(crate) fn explicit_scan(&self) -> bool {
        self.get().explicit_scan
    }

    fn set_handler(&self, handler: Option<&'d dyn ScanHandler>) {
        self.handler.lock(|h| h.set(handler));
    }
}

impl<'d> Stack<'d> {
    /// Start advertising with AD data `ad` and scan response data `sd`
    ///
    /// Advertising is restarted automatically whenever an LE link ends,
    /// until [`stop_advertising`](Self::stop_advertising) is called.
    ///
    /// # Errors
    /// * [`Error::InvalidParameter`] for an interval out of range or data
    ///   that does not fit in 31 bytes
    /// * [`Error::Already`] if advertising is already on
    /// * [`Error::Hci`] if the controller rejects a command
    pub async fn start_advertising(
        &self,
        params: &AdvParams,
        ad: &[AdStructure<'_>],
        sd: &[AdStructure<'_>],
    ) -> Result<(), Error> {
        if !params.is_valid() {
            return Err(Error::InvalidParameter);
        }
        let (ad_len, ad_data) = encode_ad(ad)?;
        let (sd_len, sd_data) = encode_ad(sd)?;
        if self.gap.keep_advertising() {
            return Err(Error::Already);
        }

        if self.gap.get().advertising {
            self.set_advertise_enable(false).await?;
        }
        self.exec(&LeSetAdvData::new(ad_len, ad_data)).await?;
        if params.kind != AdvType::NonConnectable {
            self.exec(&LeSetScanResponseData::new(sd_len, sd_data))
                .await?;
        }
        self.exec(&LeSetAdvParams::new(
            units(params.interval_min),
            units(params.interval_max),
            params.kind.to_hci(),
            self.local_info().address.kind,
            AddrKind::PUBLIC,
            BdAddr::new([0; 6]),
            AdvChannelMap::ALL,
            AdvFilterPolicy::Unfiltered,
        ))
        .await?;
        self.set_advertise_enable(true).await?;

        self.gap.update(|f| f.keep_advertising = true);
        info!("[GAP] advertising started: {:?}", params.kind);
        Ok(())
    }

    /// Stop advertising
    ///
    /// # Errors
    /// [`Error::Already`] if advertising was not on, [`Error::Hci`] if the
    /// controller rejects the command
    pub async fn stop_advertising(&self) -> Result<(), Error> {
        let was_on = self.gap.update(|f| core::mem::take(&mut f.keep_advertising));
        if !was_on {
            return Err(Error::Already);
        }
        if !self.gap.get().advertising {
            return Ok(());
        }
        self.set_advertise_enable(false).await?;
        info!("[GAP] advertising stopped");
        Ok(())
    }

    /// Turn advertising back on after a link ended
    pub(crate) async fn reenable_advertising(&self) -> Result<(), Error> {
        let flags = self.gap.get();
        if !flags.keep_advertising || flags.advertising {
            return Ok(());
        }
        self.set_advertise_enable(true).await
    }

    async fn set_advertise_enable(&self, enable: bool) -> Result<(), Error> {
        self.exec(&LeSetAdvEnable::new(enable)).await?;
        self.gap.update(|f| f.advertising = enable);
        Ok(())
    }

    /// Start an explicit scan, delivering every report to `handler`
    ///
    /// Background scanning for pending connections is suspended until
    /// [`stop_scan`](Self::stop_scan).
    ///
    /// # Errors
    /// * [`Error::InvalidParameter`] for an interval or window out of range
    /// * [`Error::Already`] if an explicit scan is running
    /// * [`Error::Hci`] if the controller rejects a command
    pub async fn start_scan(
        &self,
        params: &ScanParams,
        handler: &'d dyn ScanHandler,
    ) -> Result<(), Error> {
        if !params.is_valid() {
            return Err(Error::InvalidParameter);
        }
        let running = self.gap.update(|f| core::mem::replace(&mut f.explicit_scan, true));
        if running {
            return Err(Error::Already);
        }

        self.gap.set_handler(Some(handler));
        let result = self.restart_scan(params).await;
        if result.is_err() {
            self.gap.update(|f| f.explicit_scan = false);
            self.gap.set_handler(None);
        }
        result
    }

    async fn restart_scan(&self, params: &ScanParams) -> Result<(), Error> {
        if self.gap.get().scanning {
            self.set_scan_enable(false, false).await?;
        }
        self.start_le_scan(params).await
    }

    /// Stop the explicit scan and fall back to background scanning
    ///
    /// # Errors
    /// [`Error::Already`] if no explicit scan was running, [`Error::Hci`] if
    /// the controller rejects a command
    pub async fn stop_scan(&self) -> Result<(), Error> {
        let running = self.gap.update(|f| core::mem::take(&mut f.explicit_scan));
        if !running {
            return Err(Error::Already);
        }
        self.gap.set_handler(None);
        self.scan_update(false).await
    }

    /// Run the passive background scan if some connection waits for its peer
    pub(crate) async fn scan_update(&self, fast: bool) -> Result<(), Error> {
        if self.gap.explicit_scan() {
            return Ok(());
        }
        if self.gap.get().scanning {
            self.set_scan_enable(false, false).await?;
        }
        if !self.connections.any_in_state(ConnectionState::ConnectScan) {
            return Ok(());
        }

        let (interval, window) = if fast {
            (GAP_SCAN_FAST_INTERVAL, GAP_SCAN_FAST_WINDOW)
        } else {
            (GAP_SCAN_SLOW_INTERVAL, GAP_SCAN_SLOW_WINDOW)
        };
        debug!("[GAP] background scan, interval {:#x}", interval);
        self.start_le_scan(&ScanParams {
            kind: ScanType::Passive,
            filter_duplicates: true,
            interval,
            window,
        })
        .await
    }

    async fn start_le_scan(&self, params: &ScanParams) -> Result<(), Error> {
        let kind = match params.kind {
            ScanType::Passive => LeScanKind::Passive,
            ScanType::Active => LeScanKind::Active,
        };
        self.exec(&LeSetScanParams::new(
            kind,
            units(params.interval),
            units(params.window),
            self.local_info().address.kind,
            ScanningFilterPolicy::BasicUnfiltered,
        ))
        .await?;
        self.set_scan_enable(true, params.filter_duplicates).await
    }

    async fn set_scan_enable(&self, enable: bool, filter_dup: bool) -> Result<(), Error> {
        self.exec(&LeSetScanEnable::new(enable, filter_dup)).await?;
        self.gap.update(|f| f.scanning = enable);
        Ok(())
    }

    /// Route one advertising report to the scan handler or a pending connection
    pub(crate) async fn gap_advertising_report(&self, report: &AdvReport<'_>) {
        trace!("[GAP] report from {:?}, rssi {}", report.addr, report.rssi);
        if self.gap.explicit_scan() {
            if let Some(handler) = self.gap.handler.lock(Cell::get) {
                handler.report(report);
            }
            return;
        }
        if !report.is_connectable() {
            return;
        }
        let Some(id) = self
            .connections
            .find_by_addr_state(&report.addr, ConnectionState::ConnectScan)
        else {
            return;
        };

        debug!("[GAP] found pending peer {:?}", report.addr);
        self.connections.set_state(id, ConnectionState::Connecting);
        self.queue_internal(InternalCommand::CreateConnection { id })
            .await;
    }

    /// Stop the background scan and initiate the link for `id`
    pub(crate) async fn create_le_connection(&self, id: ConnId) -> Result<(), Error> {
        let result = self.send_create_connection(id).await;
        if result.is_err() {
            self.connections
                .update(id, |info| info.reason = status::UNSPECIFIED);
            self.connection_attempt_failed(id).await;
        }
        result
    }

    async fn send_create_connection(&self, id: ConnId) -> Result<(), Error> {
        let info = self.conn_info(id).ok_or(Error::NotFound)?;
        if info.state != ConnectionState::Connecting {
            return Err(Error::InvalidState);
        }
        if self.gap.get().scanning {
            self.set_scan_enable(false, false).await?;
        }

        let params = self
            .connections
            .params(id)
            .unwrap_or(self.config.conn_params);
        self.exec(&LeCreateConn::new(
            units(GAP_SCAN_FAST_INTERVAL),
            units(GAP_SCAN_FAST_INTERVAL),
            false,
            info.peer.kind,
            info.peer.addr,
            self.local_info().address.kind,
            units(params.interval_min),
            units(params.interval_max),
            params.latency,
            units(params.timeout),
            units(0),
            units(0),
        ))
        .await
        .map(drop)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::hci::Cmd;
    use bt_hci::cmd::le::LeReadRemoteFeatures;
    use crate::test_support::{
        MockTransport, TestResources, cmd_complete, cmd_status, connect_peer,
        disconnection_complete, event, le_connection_complete, run,
    };
    use crate::{Address, Config, PacketKind};
    use core::cell::RefCell;
    use embassy_futures::join::join;
    use std::vec::Vec;

    const PEER: Address = Address::public([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    const OTHER: Address = Address::random([0x01, 0x02, 0x03, 0x04, 0x05, 0xC6]);

    const NAME: &[u8] = b"wren";
    const FLAGS: [u8; 1] = [ad_flags::LE_GENERAL | ad_flags::NO_BREDR];

    #[derive(Default)]
    struct Reports(RefCell<Vec<(Address, Vec<u8>)>>);

    impl ScanHandler for Reports {
        fn report(&self, report: &AdvReport<'_>) {
            self.0.borrow_mut().push((report.addr, report.data.to_vec()));
        }
    }

    fn adv_report(kind: u8, addr: &Address, data: &[u8]) -> Vec<u8> {
        let mut body = std::vec![0x02, 1, kind];
        body.extend_from_slice(&addr.to_bytes());
        body.push(data.len() as u8);
        body.extend_from_slice(data);
        body.push(0xC4);
        event(0x3E, &body)
    }

    /// Answer the next command with success, returning its parameters
    async fn complete<C: Cmd>(stack: &Stack<'_>, mock: &MockTransport) -> Vec<u8> {
        let (opcode, params) = mock.next_command().await;
        assert_eq!(opcode, C::OPCODE);
        stack
            .deliver_bytes(PacketKind::Event, &cmd_complete(opcode, 0, &[]))
            .unwrap();
        params
    }

    #[test]
    fn test_ad_encoding_and_parsing() {
        let ad = [
            AdStructure::new(ad_type::FLAGS, &FLAGS),
            AdStructure::new(ad_type::NAME_COMPLETE, NAME),
        ];
        let (len, data) = encode_ad(&ad).unwrap();
        assert_eq!(len, 9);
        assert_eq!(&data[..9], &[2, 0x01, 0x06, 5, 0x09, b'w', b'r', b'e', b'n']);
        assert!(data[9..].iter().all(|&b| b == 0));

        let parsed: Vec<_> = AdStructure::parse(&data).collect();
        assert_eq!(parsed, ad);

        let too_long = [AdStructure::new(ad_type::MANUFACTURER_DATA, &[0; 30])];
        assert_eq!(encode_ad(&too_long), Err(Error::InvalidParameter));

        // a structure overrunning the buffer ends the iteration
        assert_eq!(AdStructure::parse(&[2, 0x01, 0x06, 9, 0x09, b'x']).count(), 1);
    }

    #[test]
    fn test_advertising_start_and_stop() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let ad = [
                AdStructure::new(ad_type::FLAGS, &FLAGS),
                AdStructure::new(ad_type::NAME_COMPLETE, NAME),
            ];
            let sd = [AdStructure::new(ad_type::NAME_SHORTENED, b"w")];
            let params = AdvParams::connectable().with_interval(0x0030, 0x0060);

            let (result, ()) = join(stack.start_advertising(&params, &ad, &sd), async {
                let data = complete::<LeSetAdvData>(&stack, &mock).await;
                assert_eq!(data[0], 9);
                assert_eq!(data.len(), 32);
                let rsp = complete::<LeSetScanResponseData>(&stack, &mock).await;
                assert_eq!(&rsp[..4], &[3, 2, 0x08, b'w']);
                let adv = complete::<LeSetAdvParams>(&stack, &mock).await;
                assert_eq!(&adv[..5], &[0x30, 0x00, 0x60, 0x00, 0x00]);
                assert_eq!(adv[13], 0x07);
                assert_eq!(complete::<LeSetAdvEnable>(&stack, &mock).await, [1]);
            })
            .await;
            result.unwrap();

            assert_eq!(
                stack.start_advertising(&params, &ad, &sd).await,
                Err(Error::Already)
            );
            mock.assert_idle().await;

            let (result, ()) = join(stack.stop_advertising(), async {
                assert_eq!(complete::<LeSetAdvEnable>(&stack, &mock).await, [0]);
            })
            .await;
            result.unwrap();
            assert_eq!(stack.stop_advertising().await, Err(Error::Already));
            mock.assert_idle().await;
        });
    }

    #[test]
    fn test_non_connectable_skips_scan_response() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let params = AdvParams::connectable()
                .with_kind(AdvType::NonConnectable)
                .with_interval(0x00A0, 0x00F0);
            let (result, ()) = join(stack.start_advertising(&params, &[], &[]), async {
                assert_eq!(complete::<LeSetAdvData>(&stack, &mock).await[0], 0);
                let adv = complete::<LeSetAdvParams>(&stack, &mock).await;
                assert_eq!(adv[4], 0x03);
                complete::<LeSetAdvEnable>(&stack, &mock).await;
            })
            .await;
            result.unwrap();
        });
    }

    #[test]
    fn test_invalid_advertising_parameters() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let base = AdvParams::connectable();
            for params in [
                base.with_interval(0x0010, 0x0100),
                base.with_interval(0x0200, 0x0100),
                base.with_interval(0x0100, 0x4001),
                base.with_kind(AdvType::ScannableUndirected)
                    .with_interval(0x0080, 0x0100),
            ] {
                assert_eq!(
                    stack.start_advertising(&params, &[], &[]).await,
                    Err(Error::InvalidParameter)
                );
            }
            let big = [AdStructure::new(ad_type::MANUFACTURER_DATA, &[0; 30])];
            assert_eq!(
                stack.start_advertising(&base, &[], &big).await,
                Err(Error::InvalidParameter)
            );
            mock.assert_idle().await;
        });
    }

    #[test]
    fn test_advertising_resumes_after_disconnection() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let (result, ()) = join(
                stack.start_advertising(&AdvParams::connectable(), &[], &[]),
                async {
                    complete::<LeSetAdvData>(&stack, &mock).await;
                    complete::<LeSetScanResponseData>(&stack, &mock).await;
                    complete::<LeSetAdvParams>(&stack, &mock).await;
                    complete::<LeSetAdvEnable>(&stack, &mock).await;
                },
            )
            .await;
            result.unwrap();

            connect_peer(&stack, &mock, 0x0040, PEER).await;
            assert!(!stack.gap.get().advertising);
            assert!(stack.gap.keep_advertising());

            stack
                .deliver_bytes(PacketKind::Event, &disconnection_complete(0x0040, 0x13))
                .unwrap();
            assert_eq!(complete::<LeSetAdvEnable>(&stack, &mock).await, [1]);
            mock.settle().await;
            assert!(stack.gap.get().advertising);
            mock.assert_idle().await;
        });
    }

    #[test]
    fn test_explicit_scan_delivers_reports() {
        let reports = Reports::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let params = ScanParams {
                kind: ScanType::Active,
                filter_duplicates: false,
                interval: 0x0100,
                window: 0x0050,
            };
            let (result, ()) = join(stack.start_scan(&params, &reports), async {
                let set = complete::<LeSetScanParams>(&stack, &mock).await;
                assert_eq!(set, [0x01, 0x00, 0x01, 0x50, 0x00, 0x00, 0x00]);
                assert_eq!(complete::<LeSetScanEnable>(&stack, &mock).await, [1, 0]);
            })
            .await;
            result.unwrap();
            assert_eq!(stack.start_scan(&params, &reports).await, Err(Error::Already));

            stack
                .deliver_bytes(PacketKind::Event, &adv_report(0x03, &OTHER, &[2, 0x01, 0x04]))
                .unwrap();
            mock.settle().await;
            assert_eq!(*reports.0.borrow(), [(OTHER, std::vec![2, 0x01, 0x04])]);

            let (result, ()) = join(stack.stop_scan(), async {
                assert_eq!(complete::<LeSetScanEnable>(&stack, &mock).await, [0, 0]);
            })
            .await;
            result.unwrap();
            assert_eq!(stack.stop_scan().await, Err(Error::Already));

            stack
                .deliver_bytes(PacketKind::Event, &adv_report(0x00, &OTHER, &[]))
                .unwrap();
            mock.assert_idle().await;
            assert_eq!(reports.0.borrow().len(), 1);
        });
    }

    #[test]
    fn test_invalid_scan_parameters() {
        let reports = Reports::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            for (interval, window) in [(0x0040, 0x0050), (0x0002, 0x0002), (0x4001, 0x0010)] {
                let params = ScanParams {
                    interval,
                    window,
                    ..ScanParams::passive()
                };
                assert_eq!(
                    stack.start_scan(&params, &reports).await,
                    Err(Error::InvalidParameter)
                );
            }
            mock.assert_idle().await;
        });
    }

    #[test]
    fn test_failed_scan_start_clears_explicit_scan() {
        let reports = Reports::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let (result, ()) = join(stack.start_scan(&ScanParams::active(), &reports), async {
                let (opcode, _) = mock.next_command().await;
                stack
                    .deliver_bytes(PacketKind::Event, &cmd_complete(opcode, 0x0C, &[]))
                    .unwrap();
            })
            .await;
            assert_eq!(result, Err(Error::Hci(0x0C)));
            assert!(!stack.gap.get().explicit_scan);
            assert_eq!(stack.stop_scan().await, Err(Error::Already));
        });
    }

    #[test]
    fn test_background_scan_creates_pending_connection() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let params = stack.config().conn_params;
            let (conn, ()) = join(
                async { stack.connect(&PEER, &params).await.unwrap() },
                async {
                    let set = complete::<LeSetScanParams>(&stack, &mock).await;
                    assert_eq!(set, [0x00, 0x60, 0x00, 0x30, 0x00, 0x00, 0x00]);
                    assert_eq!(complete::<LeSetScanEnable>(&stack, &mock).await, [1, 1]);
                },
            )
            .await;
            assert_eq!(conn.state(), ConnectionState::ConnectScan);

            // other peers and non-connectable advertising are ignored
            stack
                .deliver_bytes(PacketKind::Event, &adv_report(0x00, &OTHER, &[]))
                .unwrap();
            stack
                .deliver_bytes(PacketKind::Event, &adv_report(0x03, &PEER, &[]))
                .unwrap();
            mock.assert_idle().await;

            stack
                .deliver_bytes(PacketKind::Event, &adv_report(0x00, &PEER, &[]))
                .unwrap();
            assert_eq!(complete::<LeSetScanEnable>(&stack, &mock).await, [0, 0]);
            let (opcode, create) = mock.next_command().await;
            assert_eq!(opcode, LeCreateConn::OPCODE);
            assert_eq!(&create[..5], &[0x60, 0x00, 0x60, 0x00, 0x00]);
            assert_eq!(create[5], 0x00);
            assert_eq!(&create[6..12], &PEER.bytes());
            assert_eq!(&create[13..15], &params.interval_min.to_le_bytes());
            stack
                .deliver_bytes(PacketKind::Event, &cmd_status(opcode, 0))
                .unwrap();
            mock.settle().await;
            assert_eq!(conn.state(), ConnectionState::Connecting);

            stack
                .deliver_bytes(
                    PacketKind::Event,
                    &le_connection_complete(0, 0x0041, 0x00, &PEER, 0x0020),
                )
                .unwrap();
            let (opcode, _) = mock.next_command().await;
            assert_eq!(opcode, LeReadRemoteFeatures::OPCODE);
            stack
                .deliver_bytes(PacketKind::Event, &cmd_status(opcode, 0))
                .unwrap();

            conn.wait_connected().await.unwrap();
            assert_eq!(conn.handle(), 0x0041);
            mock.assert_idle().await;
        });
    }

    #[test]
    fn test_create_connection_failure_ends_attempt() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let params = stack.config().conn_params;
            let (conn, ()) = join(
                async { stack.connect(&PEER, &params).await.unwrap() },
                async {
                    complete::<LeSetScanParams>(&stack, &mock).await;
                    complete::<LeSetScanEnable>(&stack, &mock).await;
                },
            )
            .await;

            stack
                .deliver_bytes(PacketKind::Event, &adv_report(0x01, &PEER, &[]))
                .unwrap();
            complete::<LeSetScanEnable>(&stack, &mock).await;
            let (opcode, _) = mock.next_command().await;
            stack
                .deliver_bytes(PacketKind::Event, &cmd_status(opcode, 0x0C))
                .unwrap();

            assert_eq!(
                conn.wait_connected().await,
                Err(Error::Hci(status::UNSPECIFIED))
            );
            mock.assert_idle().await;
            drop(conn);
            assert_eq!(stack.connection_count(), 0);
        });
    }

    #[test]
    fn test_explicit_scan_suspends_background_scan() {
        let reports = Reports::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let (result, ()) = join(stack.start_scan(&ScanParams::passive(), &reports), async {
                complete::<LeSetScanParams>(&stack, &mock).await;
                complete::<LeSetScanEnable>(&stack, &mock).await;
            })
            .await;
            result.unwrap();

            // a pending connection waits while the explicit scan runs
            stack.set_auto_connect(&PEER, true).await.unwrap();
            mock.assert_idle().await;
            let id = stack.connections.find_by_addr(&PEER).unwrap();
            let conn = stack.connection(id).unwrap();
            assert_eq!(conn.state(), ConnectionState::ConnectScan);

            stack
                .deliver_bytes(PacketKind::Event, &adv_report(0x00, &PEER, &[]))
                .unwrap();
            mock.assert_idle().await;
            assert_eq!(reports.0.borrow().len(), 1);

            // stopping hands over to the slow background scan
            let (result, ()) = join(stack.stop_scan(), async {
                assert_eq!(complete::<LeSetScanEnable>(&stack, &mock).await, [0, 0]);
                let set = complete::<LeSetScanParams>(&stack, &mock).await;
                assert_eq!(&set[..5], &[0x00, 0x00, 0x08, 0x12, 0x00]);
                complete::<LeSetScanEnable>(&stack, &mock).await;
            })
            .await;
            result.unwrap();
            assert_eq!(conn.state(), ConnectionState::ConnectScan);
        });
    }
}
