//! 90-byte request/response framing, CRC, pacing, and the exchange
//! state machine.
//!
//! The set_report goes out as a feature report on id 0 and the result is
//! read back from the same id. Raw layout:
//!
//! ```text
//! Bytes       Contents
//! ---------   ----------------------
//! 0           Status code (0x00 on requests)
//! 1           Transaction id
//! 2-3         Remaining packets (big-endian)
//! 4           Protocol type
//! 5           Data size
//! 6           Command class
//! 7           Command id
//! 8-87        Report data
//! 88          CRC (XOR of bytes 1..=86)
//! 89          Reserved (zero)
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use zerocopy::byteorder::{BigEndian, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::TransportError;
use crate::hid::FeatureEndpoint;

/// Full report size on the wire.
pub const BUF_SIZE: usize = 90;
/// Size of the argument area.
pub const DATA_BUF_SIZE: usize = 80;
/// Report id used for both send and receive.
pub const REPORT_ID: u8 = 0x00;

/// Time between requests; shorter and the hardware answers BUSY.
/// May need adjustment on a per-model basis.
pub const CMD_DELAY: Duration = Duration::from_millis(7);

/// Pause between retries of a failed exchange.
const RETRY_DELAY: Duration = Duration::from_millis(100);
const RETRY_COUNT: u32 = 3;

/// Status codes returned by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Unknown = 0x00,
    Busy = 0x01,
    Ok = 0x02,
    Fail = 0x03,
    Timeout = 0x04,
    Unsupported = 0x05,
    BadCrc = 0xFE,
    OsError = 0xFF,
}

impl Status {
    pub fn from_u8(value: u8) -> Status {
        match value {
            0x01 => Status::Busy,
            0x02 => Status::Ok,
            0x03 => Status::Fail,
            0x04 => Status::Timeout,
            0x05 => Status::Unsupported,
            0xFE => Status::BadCrc,
            0xFF => Status::OsError,
            _ => Status::Unknown,
        }
    }
}

/// XOR checksum over the transaction id through the end of the args area.
pub fn crc(buf: &[u8]) -> u8 {
    buf[1..87].iter().fold(0u8, |acc, b| acc ^ b)
}

/// Argument area builder with an append cursor.
#[derive(Clone)]
pub struct ByteArgs {
    data: [u8; DATA_BUF_SIZE],
    ptr: usize,
}

impl Default for ByteArgs {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteArgs {
    pub fn new() -> Self {
        Self {
            data: [0u8; DATA_BUF_SIZE],
            ptr: 0,
        }
    }

    pub fn put(&mut self, value: u8) -> &mut Self {
        if self.ptr < DATA_BUF_SIZE {
            self.data[self.ptr] = value;
            self.ptr += 1;
        }
        self
    }

    /// Big-endian, matching the multi-byte fields of the wire protocol.
    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.put((value >> 8) as u8);
        self.put(value as u8)
    }

    pub fn put_slice(&mut self, values: &[u8]) -> &mut Self {
        let n = values.len().min(DATA_BUF_SIZE - self.ptr);
        self.data[self.ptr..self.ptr + n].copy_from_slice(&values[..n]);
        self.ptr += n;
        self
    }

    pub fn clear(&mut self) {
        self.data = [0u8; DATA_BUF_SIZE];
        self.ptr = 0;
    }

    pub fn len(&self) -> usize {
        self.ptr
    }

    pub fn is_empty(&self) -> bool {
        self.ptr == 0
    }

    pub fn data(&self) -> &[u8; DATA_BUF_SIZE] {
        &self.data
    }
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug)]
#[repr(C)]
struct ReportHeader {
    status: u8,
    transaction_id: u8,
    remaining_packets: U16<BigEndian>,
    protocol_type: u8,
    data_size: u8,
    command_class: u8,
    command_id: u8,
}

/// One request/response pair against the hardware.
///
/// Build the request with [`ByteArgs`], run it through [`run_report`], then
/// read the parsed payload from [`RazerReport::result`]. Reports are
/// reusable: `clear()` resets everything but the command identity, which is
/// how the frame path streams one row after another through a single report.
pub struct RazerReport {
    transaction_id: u8,
    remaining_packets: u16,
    protocol_type: u8,
    data_size: Option<u8>,
    command_class: u8,
    command_id: u8,
    args: ByteArgs,
    status: Status,
    result: Vec<u8>,
}

impl RazerReport {
    pub fn new(
        command_class: u8,
        command_id: u8,
        data_size: Option<u8>,
        transaction_id: u8,
    ) -> Self {
        Self {
            transaction_id,
            remaining_packets: 0,
            protocol_type: 0,
            data_size,
            command_class,
            command_id,
            args: ByteArgs::new(),
            status: Status::Unknown,
            result: Vec::new(),
        }
    }

    pub fn args(&mut self) -> &mut ByteArgs {
        &mut self.args
    }

    pub fn remaining_packets(&self) -> u16 {
        self.remaining_packets
    }

    pub fn set_remaining_packets(&mut self, remaining: u16) {
        self.remaining_packets = remaining;
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Payload of the last successful exchange.
    pub fn result(&self) -> &[u8] {
        &self.result
    }

    pub fn command_class(&self) -> u8 {
        self.command_class
    }

    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    pub fn transaction_id(&self) -> u8 {
        self.transaction_id
    }

    /// Reset args and response state so the report can be reused.
    pub fn clear(&mut self) {
        self.args.clear();
        self.remaining_packets = 0;
        self.status = Status::Unknown;
        self.result.clear();
    }

    /// Serialize the request into its wire form.
    pub fn pack(&self) -> [u8; BUF_SIZE] {
        let mut buf = [0u8; BUF_SIZE];

        let header = ReportHeader {
            status: 0x00,
            transaction_id: self.transaction_id,
            remaining_packets: U16::new(self.remaining_packets),
            protocol_type: self.protocol_type,
            data_size: self.data_size.unwrap_or(self.args.len() as u8),
            command_class: self.command_class,
            command_id: self.command_id,
        };
        buf[..8].copy_from_slice(header.as_bytes());
        buf[8..88].copy_from_slice(self.args.data());
        buf[88] = crc(&buf);
        buf
    }

    /// Parse a response buffer, returning true when the status is OK.
    ///
    /// The CRC is not validated on OK responses (observed hardware returns
    /// zero there); on any other status a mismatch downgrades the reply to
    /// BAD_CRC so the caller retries.
    pub fn parse_response(&mut self, buf: &[u8]) -> Result<bool, TransportError> {
        if buf.len() != BUF_SIZE {
            return Err(TransportError::ShortResponse {
                expected: BUF_SIZE,
                actual: buf.len(),
            });
        }

        let header = ReportHeader::read_from_bytes(&buf[..8])
            .expect("header slice is exactly 8 unaligned bytes");

        let data_size = (header.data_size as usize).min(DATA_BUF_SIZE);
        self.status = Status::from_u8(header.status);
        self.result = buf[8..8 + data_size].to_vec();

        if self.status == Status::Ok {
            return Ok(true);
        }

        if crc(buf) != buf[88] {
            warn!(
                "CRC mismatch on response for command {:02x},{:02x}",
                self.command_class, self.command_id
            );
            self.status = Status::BadCrc;
        }

        if self.status == Status::Unsupported {
            debug!(
                "Command {:02x},{:02x} returned UNSUPPORTED",
                self.command_class, self.command_id
            );
        } else {
            error!(
                "Got error {:?} for command {:02x},{:02x}",
                self.status, self.command_class, self.command_id
            );
            hexdump("raw response: ", &self.result);
        }

        Ok(false)
    }
}

fn hexdump(tag: &str, data: &[u8]) {
    if tracing::enabled!(tracing::Level::TRACE) {
        let dump: String = data.iter().map(|b| format!("{b:02x} ")).collect();
        trace!("{}{}", tag, dump);
    }
}

/// Absolute pacing between successive commands on one device.
///
/// The delay is measured from the previous wire write, not slept after each
/// one, so back-to-back commands from different subsystems never undershoot
/// the inter-command gap.
#[derive(Default)]
pub struct Pacing {
    last_cmd: Option<Instant>,
}

impl Pacing {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pace(&mut self, delay: Duration) {
        if let Some(last) = self.last_cmd {
            let target = last + delay;
            let now = Instant::now();
            if target > now {
                tokio::time::sleep(target - now).await;
            }
        }
        self.last_cmd = Some(Instant::now());
    }

    pub fn mark(&mut self) {
        self.last_cmd = Some(Instant::now());
    }

    pub fn last_cmd_time(&self) -> Option<Instant> {
        self.last_cmd
    }
}

/// Callback invoked with the response status; wireless devices use it to
/// track the offline state of the remote end.
pub type TimeoutCallback<'a> = &'a mut (dyn FnMut(Status, Option<&[u8]>) + Send);

/// Drive one exchange: pace, send, pace, read, parse, retry.
///
/// Returns Ok(true) on an OK reply (or a partial send when
/// `remaining_packets > 0`), Ok(false) on UNSUPPORTED or after retries are
/// exhausted. Transport failures bubble as errors so the device layer can
/// recycle its handle.
pub async fn run_report(
    endpoint: &mut dyn FeatureEndpoint,
    report: &mut RazerReport,
    pacing: &mut Pacing,
    delay: Duration,
    mut timeout_cb: Option<TimeoutCallback<'_>>,
) -> Result<bool, TransportError> {
    let mut retries = RETRY_COUNT;

    loop {
        let req = report.pack();
        hexdump("--> ", &req);

        if report.remaining_packets() == 0 {
            pacing.pace(delay).await;
        }
        endpoint.send_feature_report(&req)?;

        // Caller will push more packets of the same logical transfer;
        // the response only comes after the last one.
        if report.remaining_packets() > 0 {
            return Ok(true);
        }

        pacing.pace(delay).await;
        let resp = endpoint.get_feature_report(REPORT_ID, BUF_SIZE)?;
        hexdump("<-- ", &resp);

        if report.parse_response(&resp)? {
            if let Some(cb) = timeout_cb.as_deref_mut() {
                cb(Status::Ok, None);
            }
            return Ok(true);
        }

        match report.status() {
            Status::Unsupported => return Ok(false),
            Status::Timeout => {
                if let Some(cb) = timeout_cb.as_deref_mut() {
                    cb(Status::Timeout, Some(report.result()));
                }
                return Ok(false);
            }
            status => {
                if retries == 0 {
                    warn!("Giving up on command after retries, status {status:?}");
                    return Ok(false);
                }
                warn!("Retrying request due to status {status:?} ({retries})");
                tokio::time::sleep(RETRY_DELAY).await;
                retries -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::testing::MockEndpoint;

    #[test]
    fn test_pack_canonical_request() {
        let mut report = RazerReport::new(0x03, 0x0A, Some(3), 0xFF);
        report.args().put(0x01).put(0x02).put(0x03);

        let buf = report.pack();
        assert_eq!(buf.len(), 90);
        assert_eq!(buf[0], 0x00);
        assert_eq!(buf[1], 0xFF);
        assert_eq!(&buf[2..4], &[0x00, 0x00]);
        assert_eq!(buf[4], 0x00);
        assert_eq!(buf[5], 0x03);
        assert_eq!(buf[6], 0x03);
        assert_eq!(buf[7], 0x0A);
        assert_eq!(&buf[8..11], &[0x01, 0x02, 0x03]);
        assert!(buf[11..88].iter().all(|&b| b == 0));
        // 0xFF ^ 0x03 ^ 0x03 ^ 0x0A ^ 0x01 ^ 0x02 ^ 0x03
        assert_eq!(buf[88], 0xF5);
        assert_eq!(buf[88], crc(&buf));
        assert_eq!(buf[89], 0x00);
    }

    #[test]
    fn test_crc_law_holds_for_all_requests() {
        for class in [0x00u8, 0x03, 0x07, 0x0D, 0x0F] {
            for id in [0x00u8, 0x0A, 0x81, 0xFF] {
                let mut report = RazerReport::new(class, id, None, 0x3F);
                report.args().put_slice(&[id, class, 0x55]);
                let buf = report.pack();
                assert_eq!(buf[88], crc(&buf));
                assert_eq!(buf[89], 0x00);
            }
        }
    }

    #[test]
    fn test_parse_ok_response() {
        let mut buf = vec![0u8; 90];
        buf[0] = 0x02;
        buf[1] = 0xFF;
        buf[5] = 0x02;
        buf[6] = 0x00;
        buf[7] = 0x81;
        buf[8] = 0x01;
        buf[9] = 0x05;

        let mut report = RazerReport::new(0x00, 0x81, Some(2), 0xFF);
        assert!(report.parse_response(&buf).unwrap());
        assert_eq!(report.status(), Status::Ok);
        assert_eq!(report.result(), &[0x01, 0x05]);
    }

    #[test]
    fn test_parse_skips_crc_on_ok() {
        // Zero CRC on an OK reply must be accepted.
        let mut buf = vec![0u8; 90];
        buf[0] = 0x02;
        buf[1] = 0x3F;
        buf[5] = 0x01;
        buf[8] = 0xAA;
        assert_ne!(crc(&buf), buf[88]);

        let mut report = RazerReport::new(0x03, 0x80, Some(1), 0x3F);
        assert!(report.parse_response(&buf).unwrap());
    }

    #[test]
    fn test_parse_enforces_crc_on_error() {
        let mut buf = vec![0u8; 90];
        buf[0] = 0x03; // FAIL
        buf[1] = 0xFF;
        // deliberately wrong CRC
        buf[88] = 0x55;

        let mut report = RazerReport::new(0x03, 0x00, Some(3), 0xFF);
        assert!(!report.parse_response(&buf).unwrap());
        assert_eq!(report.status(), Status::BadCrc);
    }

    #[test]
    fn test_parse_rejects_short_buffer() {
        let mut report = RazerReport::new(0x00, 0x81, Some(2), 0xFF);
        let err = report.parse_response(&[0u8; 30]).unwrap_err();
        assert!(matches!(err, TransportError::ShortResponse { .. }));
    }

    #[test]
    fn test_args_roundtrip() {
        let mut report = RazerReport::new(0x0D, 0x02, Some(4), 0x1F);
        report.args().put(0x00).put(0x01).put(0x02).put_u16(0x1234);

        let buf = report.pack();
        // Echo the request back as an OK response.
        let mut resp = buf.to_vec();
        resp[0] = 0x02;
        let mut parsed = RazerReport::new(0x0D, 0x02, Some(4), 0x1F);
        parsed.parse_response(&resp).unwrap();
        assert_eq!(&parsed.result()[..4], &[0x00, 0x01, 0x02, 0x12]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_report_ok() {
        let mut ep = MockEndpoint::new();
        ep.queue_ok(0x00, 0x81, 0xFF, &[0x01, 0x05]);

        let mut report = RazerReport::new(0x00, 0x81, Some(2), 0xFF);
        let mut pacing = Pacing::new();
        let ok = run_report(&mut ep, &mut report, &mut pacing, CMD_DELAY, None)
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(report.result(), &[0x01, 0x05]);
        assert_eq!(ep.sent.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_report_unsupported_is_false_without_retry() {
        let mut ep = MockEndpoint::new();
        let mut buf = vec![0u8; 90];
        buf[0] = 0x05;
        buf[88] = crc(&buf);
        ep.queue_response(buf);

        let mut report = RazerReport::new(0x07, 0x80, Some(2), 0xFF);
        let mut pacing = Pacing::new();
        let ok = run_report(&mut ep, &mut report, &mut pacing, CMD_DELAY, None)
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(report.status(), Status::Unsupported);
        assert_eq!(ep.sent.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_report_retries_busy() {
        let mut ep = MockEndpoint::new();
        for _ in 0..2 {
            let mut buf = vec![0u8; 90];
            buf[0] = 0x01; // BUSY
            buf[88] = crc(&buf);
            ep.queue_response(buf);
        }
        ep.queue_ok(0x03, 0x00, 0xFF, &[0x01, 0x05, 0x01]);

        let mut report = RazerReport::new(0x03, 0x00, Some(3), 0xFF);
        let mut pacing = Pacing::new();
        let ok = run_report(&mut ep, &mut report, &mut pacing, CMD_DELAY, None)
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(ep.sent.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_report_timeout_fires_callback() {
        let mut ep = MockEndpoint::new();
        let mut buf = vec![0u8; 90];
        buf[0] = 0x04; // TIMEOUT
        buf[88] = crc(&buf);
        ep.queue_response(buf);

        let mut seen = None;
        let mut cb = |status: Status, _data: Option<&[u8]>| {
            seen = Some(status);
        };

        let mut report = RazerReport::new(0x07, 0x80, Some(2), 0x3F);
        let mut pacing = Pacing::new();
        let ok = run_report(&mut ep, &mut report, &mut pacing, CMD_DELAY, Some(&mut cb))
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(seen, Some(Status::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_send_returns_early() {
        let mut ep = MockEndpoint::new();
        let mut report = RazerReport::new(0x03, 0x0B, None, 0xFF);
        report.set_remaining_packets(5);
        let mut pacing = Pacing::new();
        let ok = run_report(&mut ep, &mut report, &mut pacing, CMD_DELAY, None)
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(ep.sent.len(), 1);
        assert!(ep.responses.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_is_absolute() {
        let mut pacing = Pacing::new();
        pacing.mark();
        let before = Instant::now();
        pacing.pace(Duration::from_millis(7)).await;
        assert!(Instant::now() - before >= Duration::from_millis(7));

        // A second pace immediately after should wait the full gap again.
        let before = Instant::now();
        pacing.pace(Duration::from_millis(7)).await;
        assert!(Instant::now() - before >= Duration::from_millis(7));
    }
}
