#![cfg_attr(not(test), no_std)]

use core::convert::Infallible;
use core::marker::PhantomData;

use embedded_graphics_core::pixelcolor::{Rgb565, raw::RawU16};
use embedded_graphics_core::prelude::RawData;
use embedded_hal::digital::OutputPin;

// Screen dimensions for ST77916 360RGB×360
pub const SCREEN_WIDTH: u16 = 360;
pub const SCREEN_HEIGHT: u16 = 360;

// Scratch buffer size for chunked solid fills (four raster lines of RGB565)
pub const BUF_SIZE: usize = SCREEN_WIDTH as usize * 2 * 4;

// Transport opcodes framing every QSPI exchange. The target register number
// always travels in the high byte of the 3-byte address field that follows.
const OP_READ_CMD: u8 = 0x0B;
const OP_WRITE_CMD: u8 = 0x02;
const OP_WRITE_DATA: u8 = 0x32;

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Instruction {
    /// No Operation (00h)
    Nop = 0x00,
    /// Software Reset (01h) - Restore default register state
    SoftwareReset = 0x01,
    /// Read Display Identification (04h) - Returns manufacturer and version information
    ReadDisplayId = 0x04,
    /// Read Display Status (09h) - Checks display operating state
    ReadDisplayStatus = 0x09,
    /// Read Display Power Mode (0Ah)
    ReadPowerMode = 0x0A,
    /// Read Display MADCTL (0Bh)
    ReadMadctl = 0x0B,
    /// Read Display Pixel Format (0Ch)
    ReadColorMode = 0x0C,
    /// Read Display Image Mode (0Dh)
    ReadImageMode = 0x0D,
    /// Read Display Signal Mode (0Eh)
    ReadSignalMode = 0x0E,
    /// Read Display Self-Diagnostic Result (0Fh)
    ReadSelfDiagnostic = 0x0F,

    /// Sleep In (10h) - Enter low-power mode
    SleepIn = 0x10,
    /// Sleep Out (11h) - Exit low-power mode
    SleepOut = 0x11,
    /// Partial Display Mode On (12h) - Enable regional refresh
    PartialModeOn = 0x12,
    /// Normal Display Mode On (13h) - Full-screen mode
    NormalDisplayOn = 0x13,

    /// Display Inversion Off (20h) - Disable color inversion
    DisplayInversionOff = 0x20,
    /// Display Inversion On (21h) - Enable color inversion
    DisplayInversionOn = 0x21,

    /// Display Off (28h) - Disable panel output
    DisplayOff = 0x28,
    /// Display On (29h) - Enable panel output
    DisplayOn = 0x29,
    /// Column Address Set (2Ah) - Horizontal addressing bounds
    ColumnAddressSet = 0x2A,
    /// Row Address Set (2Bh) - Vertical addressing bounds
    RowAddressSet = 0x2B,
    /// Memory Write (2Ch) - Write to memory from the window origin
    MemoryWrite = 0x2C,
    /// Memory Read (2Eh) - Read back from memory
    MemoryRead = 0x2E,

    /// Vertical Scrolling Definition (33h)
    VerticalScrollDefine = 0x33,
    /// Tearing Effect Line Off (34h)
    TearingEffectDisable = 0x34,
    /// Tearing Effect Line On (35h) - Enable VSync output
    TearingEffectEnable = 0x35,
    /// Memory Access Control (36h) - GRAM orientation/order
    MemoryAccessControl = 0x36,
    /// Vertical Scroll Start Address (37h)
    VerticalScrollAddress = 0x37,
    /// Idle Mode Off (38h)
    IdleModeOff = 0x38,
    /// Idle Mode On (39h)
    IdleModeOn = 0x39,
    /// Pixel Format Set (3Ah) - Color depth configuration
    PixelFormatSet = 0x3A,
    /// Memory Write Continue (3Ch) - Continue a memory write without
    /// resetting the write pointer to the window origin
    MemoryWriteContinue = 0x3C,
}

/// Clock polarity/phase of the bus. The panel always runs in `Mode0`; the
/// transport may be shared with devices needing other modes, so the mode is
/// re-asserted on every transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusMode {
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

/// Data phase of a command exchange.
pub enum CommandData<'a> {
    /// The exchange ends after the address cycles.
    None,
    /// Parameter bytes clocked out after the address.
    Write(&'a [u8]),
    /// Buffer to fill from the bus after the address.
    Read(&'a mut [u8]),
}

/// One command-phase QSPI exchange: opcode, optional 24-bit address field,
/// and an optional data phase.
pub struct CommandOp<'a> {
    pub opcode: u8,
    /// 24-bit address; the target register number sits in bits 8..=15.
    pub addr: Option<u32>,
    pub data: CommandData<'a>,
}

/// Payload of a streaming memory exchange.
pub enum MemoryData<'a> {
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

/// One streaming memory QSPI exchange. The transport may split the payload
/// into several bus bursts, but byte order is strict and no other initiator
/// may interleave.
pub struct MemoryOp<'a> {
    pub opcode: u8,
    /// 24-bit address; the target register number sits in bits 8..=15.
    pub addr: u32,
    /// Dummy cycles between the address and data phases.
    pub dummies: u8,
    pub data: MemoryData<'a>,
}

#[maybe_async_cfg::maybe(
    sync(cfg(not(feature = "async")), self = "QspiBus",),
    async(feature = "async", keep_self)
)]
/// QSPI transport consumed by the driver.
///
/// embedded-hal has no quad-SPI trait, so the seam is defined here: a
/// conventional command/address/data framed serial bus with an
/// exclusive-access lock. `command` and `memory` return the number of
/// data-phase bytes actually transferred so short reads can be detected by
/// the caller.
pub trait QspiBus {
    type Error;

    /// Acquire (`true`) or release (`false`) exclusive access to the bus.
    async fn lock(&mut self, acquire: bool) -> Result<(), Self::Error>;

    fn set_word_size(&mut self, bits: u8);
    fn set_mode(&mut self, mode: BusMode);
    fn set_frequency(&mut self, frequency_hz: u32);

    /// Perform one command exchange. Requires the lock to be held.
    async fn command(&mut self, op: CommandOp<'_>) -> Result<usize, Self::Error>;

    /// Perform one streaming memory exchange. Requires the lock to be held.
    async fn memory(&mut self, op: MemoryOp<'_>) -> Result<usize, Self::Error>;
}

/// Rectangular region of panel RAM addressed by subsequent memory writes.
/// Coordinates are inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AddressWindow {
    pub sx: u16,
    pub sy: u16,
    pub ex: u16,
    pub ey: u16,
}

impl AddressWindow {
    pub const fn new(sx: u16, sy: u16, ex: u16, ey: u16) -> Self {
        Self { sx, sy, ex, ey }
    }

    fn fits(&self, width: u16, height: u16) -> bool {
        self.sx <= self.ex && self.sy <= self.ey && self.ex < width && self.ey < height
    }

    fn column_bytes(&self) -> [u8; 4] {
        [
            (self.sx >> 8) as u8,
            (self.sx & 0xFF) as u8,
            (self.ex >> 8) as u8,
            (self.ex & 0xFF) as u8,
        ]
    }

    fn row_bytes(&self) -> [u8; 4] {
        [
            (self.sy >> 8) as u8,
            (self.sy & 0xFF) as u8,
            (self.ey >> 8) as u8,
            (self.ey & 0xFF) as u8,
        ]
    }
}

#[derive(Clone, Copy)]
pub struct Config {
    pub width: u16,
    pub height: u16,
    /// Bus clock applied before every transaction.
    pub frequency_hz: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            width: SCREEN_WIDTH,
            height: SCREEN_HEIGHT,
            frequency_hz: 40_000_000,
        }
    }
}

/// Panel power state. Mutated only by `init`, `sleep` and `wake`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    /// Not brought up, or bring-up failed.
    Off,
    /// Sleep-in issued; panel output undefined.
    Sleep,
    /// Displaying; frame writes accepted.
    Active,
}

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E = ()> {
    /// Communication error, propagated from the transport unchanged
    Comm(E),
    /// Pin setting error
    Pin(Infallible),
    /// A read returned fewer bytes than requested
    ShortRead,
    /// Window coordinates inverted or outside the panel
    InvalidWindow,
    /// Operation requires the panel to be active
    NotActive,
}

/// One entry of the vendor initialization sequence: register, parameter
/// bytes, and the settling time the panel needs before the next write.
struct InitCommand {
    cmd: u8,
    params: &'static [u8],
    delay_ms: u16,
}

impl InitCommand {
    const fn new(cmd: u8, params: &'static [u8], delay_ms: u16) -> Self {
        Self {
            cmd,
            params,
            delay_ms,
        }
    }
}

// Vendor bring-up sequence (datasheet values). Order is load-bearing: the
// 0xF0/0xF1 writes select command pages for the register writes that follow,
// and the nonzero delays are settling times for the charge pump and timing
// generator. Ends with inversion + 16bpp color mode, sleep-out and display-on.
static INIT_SEQUENCE: &[InitCommand] = &[
    InitCommand::new(0xF0, &[0x08], 0),
    InitCommand::new(0xF2, &[0x08], 0),
    InitCommand::new(0x9B, &[0x51], 0),
    InitCommand::new(0x86, &[0x53], 0),
    InitCommand::new(0xF2, &[0x80], 0),
    InitCommand::new(0xF0, &[0x00], 0),
    InitCommand::new(0xF0, &[0x01], 0),
    InitCommand::new(0xF1, &[0x01], 0),
    InitCommand::new(0xB0, &[0x54], 0),
    InitCommand::new(0xB1, &[0x3F], 0),
    InitCommand::new(0xB2, &[0x2A], 0),
    InitCommand::new(0xB4, &[0x46], 0),
    InitCommand::new(0xB5, &[0x34], 0),
    InitCommand::new(0xB6, &[0xD5], 0),
    InitCommand::new(0xB7, &[0x30], 0),
    InitCommand::new(0xBA, &[0x00], 0),
    InitCommand::new(0xBB, &[0x08], 0),
    InitCommand::new(0xBC, &[0x08], 0),
    InitCommand::new(0xBD, &[0x00], 0),
    InitCommand::new(0xC0, &[0x80], 0),
    InitCommand::new(0xC1, &[0x10], 0),
    InitCommand::new(0xC2, &[0x37], 0),
    InitCommand::new(0xC3, &[0x80], 0),
    InitCommand::new(0xC4, &[0x10], 0),
    InitCommand::new(0xC5, &[0x37], 0),
    InitCommand::new(0xC6, &[0xA9], 0),
    InitCommand::new(0xC7, &[0x41], 0),
    InitCommand::new(0xC8, &[0x51], 0),
    InitCommand::new(0xC9, &[0xA9], 0),
    InitCommand::new(0xCA, &[0x41], 0),
    InitCommand::new(0xCB, &[0x51], 0),
    InitCommand::new(0xD0, &[0x91], 0),
    InitCommand::new(0xD1, &[0x68], 0),
    InitCommand::new(0xD2, &[0x69], 0),
    InitCommand::new(0xF5, &[0x00, 0xA5], 0),
    InitCommand::new(0xDD, &[0x3F], 0),
    InitCommand::new(0xDE, &[0x3F], 0),
    InitCommand::new(0xF1, &[0x10], 0),
    InitCommand::new(0xF0, &[0x00], 0),
    InitCommand::new(0xF0, &[0x02], 0),
    InitCommand::new(0xE0, &[0x70, 0x09, 0x12, 0x0C, 0x0B, 0x27, 0x38, 0x54, 0x4E, 0x19, 0x15, 0x15, 0x2C, 0x2F], 0),
    InitCommand::new(0xE1, &[0x70, 0x08, 0x11, 0x0C, 0x0B, 0x27, 0x38, 0x43, 0x4C, 0x18, 0x14, 0x14, 0x2B, 0x2D], 0),
    InitCommand::new(0xF0, &[0x10], 0),
    InitCommand::new(0xF3, &[0x10], 0),
    InitCommand::new(0xE0, &[0x08], 0),
    InitCommand::new(0xE1, &[0x00], 0),
    InitCommand::new(0xE2, &[0x00], 0),
    InitCommand::new(0xE3, &[0x00], 0),
    InitCommand::new(0xE4, &[0xE0], 0),
    InitCommand::new(0xE5, &[0x06], 0),
    InitCommand::new(0xE6, &[0x21], 0),
    InitCommand::new(0xE7, &[0x00], 0),
    InitCommand::new(0xE8, &[0x05], 0),
    InitCommand::new(0xE9, &[0x82], 0),
    InitCommand::new(0xEA, &[0xDF], 0),
    InitCommand::new(0xEB, &[0x89], 0),
    InitCommand::new(0xEC, &[0x20], 0),
    InitCommand::new(0xED, &[0x14], 0),
    InitCommand::new(0xEE, &[0xFF], 0),
    InitCommand::new(0xEF, &[0x00], 0),
    InitCommand::new(0xF8, &[0xFF], 0),
    InitCommand::new(0xF9, &[0x00], 0),
    InitCommand::new(0xFA, &[0x00], 0),
    InitCommand::new(0xFB, &[0x30], 0),
    InitCommand::new(0xFC, &[0x00], 0),
    InitCommand::new(0xFD, &[0x00], 0),
    InitCommand::new(0xFE, &[0x00], 0),
    InitCommand::new(0xFF, &[0x00], 0),
    InitCommand::new(0x60, &[0x42], 0),
    InitCommand::new(0x61, &[0xE0], 0),
    InitCommand::new(0x62, &[0x40], 0),
    InitCommand::new(0x63, &[0x40], 0),
    InitCommand::new(0x64, &[0x02], 0),
    InitCommand::new(0x65, &[0x00], 0),
    InitCommand::new(0x66, &[0x40], 0),
    InitCommand::new(0x67, &[0x03], 0),
    InitCommand::new(0x68, &[0x00], 0),
    InitCommand::new(0x69, &[0x00], 0),
    InitCommand::new(0x6A, &[0x00], 0),
    InitCommand::new(0x6B, &[0x00], 0),
    InitCommand::new(0x70, &[0x42], 0),
    InitCommand::new(0x71, &[0xE0], 0),
    InitCommand::new(0x72, &[0x40], 0),
    InitCommand::new(0x73, &[0x40], 0),
    InitCommand::new(0x74, &[0x02], 0),
    InitCommand::new(0x75, &[0x00], 0),
    InitCommand::new(0x76, &[0x40], 0),
    InitCommand::new(0x77, &[0x03], 0),
    InitCommand::new(0x78, &[0x00], 0),
    InitCommand::new(0x79, &[0x00], 0),
    InitCommand::new(0x7A, &[0x00], 0),
    InitCommand::new(0x7B, &[0x00], 0),
    InitCommand::new(0x80, &[0x48], 0),
    InitCommand::new(0x81, &[0x00], 0),
    InitCommand::new(0x82, &[0x05], 0),
    InitCommand::new(0x83, &[0x02], 0),
    InitCommand::new(0x84, &[0xDD], 0),
    InitCommand::new(0x85, &[0x00], 0),
    InitCommand::new(0x86, &[0x00], 0),
    InitCommand::new(0x87, &[0x00], 0),
    InitCommand::new(0x88, &[0x48], 0),
    InitCommand::new(0x89, &[0x00], 0),
    InitCommand::new(0x8A, &[0x07], 0),
    InitCommand::new(0x8B, &[0x02], 0),
    InitCommand::new(0x8C, &[0xDF], 0),
    InitCommand::new(0x8D, &[0x00], 0),
    InitCommand::new(0x8E, &[0x00], 0),
    InitCommand::new(0x8F, &[0x00], 0),
    InitCommand::new(0x90, &[0x48], 0),
    InitCommand::new(0x91, &[0x00], 0),
    InitCommand::new(0x92, &[0x09], 0),
    InitCommand::new(0x93, &[0x02], 0),
    InitCommand::new(0x94, &[0xE1], 0),
    InitCommand::new(0x95, &[0x00], 0),
    InitCommand::new(0x96, &[0x00], 0),
    InitCommand::new(0x97, &[0x00], 0),
    InitCommand::new(0x98, &[0x48], 0),
    InitCommand::new(0x99, &[0x00], 0),
    InitCommand::new(0x9A, &[0x0B], 0),
    InitCommand::new(0x9B, &[0x02], 0),
    InitCommand::new(0x9C, &[0xE3], 0),
    InitCommand::new(0x9D, &[0x00], 0),
    InitCommand::new(0x9E, &[0x00], 0),
    InitCommand::new(0x9F, &[0x00], 0),
    InitCommand::new(0xA0, &[0x48], 0),
    InitCommand::new(0xA1, &[0x00], 0),
    InitCommand::new(0xA2, &[0x04], 0),
    InitCommand::new(0xA3, &[0x02], 0),
    InitCommand::new(0xA4, &[0xDC], 0),
    InitCommand::new(0xA5, &[0x00], 0),
    InitCommand::new(0xA6, &[0x00], 0),
    InitCommand::new(0xA7, &[0x00], 0),
    InitCommand::new(0xA8, &[0x48], 0),
    InitCommand::new(0xA9, &[0x00], 0),
    InitCommand::new(0xAA, &[0x06], 0),
    InitCommand::new(0xAB, &[0x02], 0),
    InitCommand::new(0xAC, &[0xDE], 0),
    InitCommand::new(0xAD, &[0x00], 0),
    InitCommand::new(0xAE, &[0x00], 0),
    InitCommand::new(0xAF, &[0x00], 0),
    InitCommand::new(0xB0, &[0x48], 0),
    InitCommand::new(0xB1, &[0x00], 0),
    InitCommand::new(0xB2, &[0x08], 0),
    InitCommand::new(0xB3, &[0x02], 0),
    InitCommand::new(0xB4, &[0xE0], 0),
    InitCommand::new(0xB5, &[0x00], 0),
    InitCommand::new(0xB6, &[0x00], 0),
    InitCommand::new(0xB7, &[0x00], 0),
    InitCommand::new(0xB8, &[0x48], 0),
    InitCommand::new(0xB9, &[0x00], 0),
    InitCommand::new(0xBA, &[0x0A], 0),
    InitCommand::new(0xBB, &[0x02], 0),
    InitCommand::new(0xBC, &[0xE2], 0),
    InitCommand::new(0xBD, &[0x00], 0),
    InitCommand::new(0xBE, &[0x00], 0),
    InitCommand::new(0xBF, &[0x00], 0),
    InitCommand::new(0xC0, &[0x12], 0),
    InitCommand::new(0xC1, &[0xAA], 0),
    InitCommand::new(0xC2, &[0x65], 0),
    InitCommand::new(0xC3, &[0x74], 0),
    InitCommand::new(0xC4, &[0x47], 0),
    InitCommand::new(0xC5, &[0x56], 0),
    InitCommand::new(0xC6, &[0x00], 0),
    InitCommand::new(0xC7, &[0x88], 0),
    InitCommand::new(0xC8, &[0x99], 0),
    InitCommand::new(0xC9, &[0x33], 0),
    InitCommand::new(0xD0, &[0x21], 0),
    InitCommand::new(0xD1, &[0xAA], 0),
    InitCommand::new(0xD2, &[0x65], 0),
    InitCommand::new(0xD3, &[0x74], 0),
    InitCommand::new(0xD4, &[0x47], 0),
    InitCommand::new(0xD5, &[0x56], 0),
    InitCommand::new(0xD6, &[0x00], 0),
    InitCommand::new(0xD7, &[0x88], 0),
    InitCommand::new(0xD8, &[0x99], 0),
    InitCommand::new(0xD9, &[0x33], 0),
    InitCommand::new(0xF3, &[0x01], 0),
    InitCommand::new(0xF0, &[0x00], 0),
    InitCommand::new(0xF0, &[0x01], 0),
    InitCommand::new(0xF1, &[0x01], 0),
    InitCommand::new(0xA0, &[0x0B], 0),
    InitCommand::new(0xA3, &[0x2A], 0),
    InitCommand::new(0xA5, &[0xC3], 1),
    InitCommand::new(0xA3, &[0x2B], 0),
    InitCommand::new(0xA5, &[0xC3], 1),
    InitCommand::new(0xA3, &[0x2C], 0),
    InitCommand::new(0xA5, &[0xC3], 1),
    InitCommand::new(0xA3, &[0x2D], 0),
    InitCommand::new(0xA5, &[0xC3], 1),
    InitCommand::new(0xA3, &[0x2E], 0),
    InitCommand::new(0xA5, &[0xC3], 1),
    InitCommand::new(0xA3, &[0x2F], 0),
    InitCommand::new(0xA5, &[0xC3], 1),
    InitCommand::new(0xA3, &[0x30], 0),
    InitCommand::new(0xA5, &[0xC3], 1),
    InitCommand::new(0xA3, &[0x31], 0),
    InitCommand::new(0xA5, &[0xC3], 1),
    InitCommand::new(0xA3, &[0x32], 0),
    InitCommand::new(0xA5, &[0xC3], 1),
    InitCommand::new(0xA3, &[0x33], 0),
    InitCommand::new(0xA5, &[0xC3], 1),
    InitCommand::new(0xA0, &[0x09], 0),
    InitCommand::new(0xF1, &[0x10], 0),
    InitCommand::new(0xF0, &[0x00], 0),
    InitCommand::new(0x2A, &[0x00, 0x00, 0x01, 0x67], 0),
    InitCommand::new(0x2B, &[0x01, 0x68, 0x01, 0x68], 0),
    InitCommand::new(0x4D, &[0x00], 0),
    InitCommand::new(0x4E, &[0x00], 0),
    InitCommand::new(0x4F, &[0x00], 0),
    InitCommand::new(0x4C, &[0x01], 10),
    InitCommand::new(0x4C, &[0x00], 0),
    InitCommand::new(0x2A, &[0x00, 0x00, 0x01, 0x67], 0),
    InitCommand::new(0x2B, &[0x00, 0x00, 0x01, 0x67], 0),
    InitCommand::new(0x21, &[0x00], 0),
    InitCommand::new(0x3A, &[0x55], 0),
    InitCommand::new(0x11, &[0x00], 100),
    InitCommand::new(0x29, &[0x00], 20),
];

pub struct St77916<'b, B, RST, TIMER>
where
    B: QspiBus,
    RST: OutputPin<Error = Infallible>,
    TIMER: Timer,
{
    bus: B,
    rst: RST,
    config: Config,
    power: PowerState,
    buffer: &'b mut [u8],
    _timer: PhantomData<TIMER>,
}

#[maybe_async_cfg::maybe(
    sync(cfg(not(feature = "async")), self = "St77916",),
    async(feature = "async", keep_self)
)]
impl<'b, B, RST, E, TIMER> St77916<'b, B, RST, TIMER>
where
    B: QspiBus<Error = E>,
    RST: OutputPin<Error = Infallible>,
    TIMER: Timer,
{
    /// Create the driver in the `Off` state. The bus handle is owned
    /// exclusively for the driver's lifetime; `buffer` is scratch space for
    /// the solid-fill helpers and should be at least [`BUF_SIZE`] bytes.
    pub fn new(config: Config, bus: B, rst: RST, buffer: &'b mut [u8]) -> Self {
        Self {
            bus,
            rst,
            config,
            power: PowerState::Off,
            buffer,
            _timer: PhantomData,
        }
    }

    /// Bring the panel up: hardware reset, then the vendor register sequence
    /// in table order with the mandated settling delays between entries.
    ///
    /// Fails fast on the first transport error; the panel is then in an
    /// undefined, partially configured state and the driver stays `Off` -
    /// frame writes are rejected until a later `init` attempt succeeds.
    pub async fn init(&mut self) -> Result<(), Error<E>> {
        self.reset().await?;

        for entry in INIT_SEQUENCE {
            self.send_command(entry.cmd, entry.params).await?;
            if entry.delay_ms > 0 {
                TIMER::delay_ms(entry.delay_ms as u64).await;
            }
        }

        self.power = PowerState::Active;
        Ok(())
    }

    pub async fn reset(&mut self) -> Result<(), Error<E>> {
        self.rst.set_high().map_err(Error::Pin)?;
        TIMER::delay_ms(10).await;
        self.rst.set_low().map_err(Error::Pin)?;
        TIMER::delay_ms(10).await;
        self.rst.set_high().map_err(Error::Pin)?;
        TIMER::delay_ms(120).await; // Wait for reset to complete

        Ok(())
    }

    pub fn power_state(&self) -> PowerState {
        self.power
    }

    /// Enter sleep mode. Frame writes are rejected until `wake`.
    pub async fn sleep(&mut self) -> Result<(), Error<E>> {
        if self.power != PowerState::Active {
            return Err(Error::NotActive);
        }
        self.send_command(Instruction::SleepIn as u8, &[]).await?;
        TIMER::delay_ms(10).await;
        self.power = PowerState::Sleep;
        Ok(())
    }

    /// Leave sleep mode. The panel needs 120ms after sleep-out before
    /// further commands are safe.
    pub async fn wake(&mut self) -> Result<(), Error<E>> {
        if self.power != PowerState::Sleep {
            return Err(Error::NotActive);
        }
        self.send_command(Instruction::SleepOut as u8, &[]).await?;
        TIMER::delay_ms(120).await;
        self.power = PowerState::Active;
        Ok(())
    }

    /// Set the address window for subsequent memory writes.
    ///
    /// Issues exactly two commands, column bounds then row bounds, each as
    /// big-endian start/end pairs. If either fails the window is in an
    /// unspecified state and must be re-set before the next pixel write.
    pub async fn set_window(&mut self, window: AddressWindow) -> Result<(), Error<E>> {
        if !window.fits(self.config.width, self.config.height) {
            return Err(Error::InvalidWindow);
        }

        self.send_command(Instruction::ColumnAddressSet as u8, &window.column_bytes())
            .await?;
        self.send_command(Instruction::RowAddressSet as u8, &window.row_bytes())
            .await
    }

    /// Stream pixel data into the current window as one continuous memory
    /// write, in strict raster order. A zero-length buffer is a legal no-op
    /// that still issues the transaction (prime the window, defer the data).
    pub async fn write_pixels(&mut self, pixels: &[u8]) -> Result<(), Error<E>> {
        self.send_bulk(Instruction::MemoryWrite as u8, pixels).await
    }

    /// Write a rectangular region of pixel data: set the window, then stream
    /// the payload. The borrow on `self` keeps the two-transaction pair
    /// atomic per driver instance, and the bus handle is owned exclusively,
    /// so no other initiator can inject a transaction in between.
    ///
    /// On failure the panel's window is unspecified; the whole operation must
    /// be retried from the start.
    pub async fn write_frame(
        &mut self,
        window: AddressWindow,
        pixels: &[u8],
    ) -> Result<(), Error<E>> {
        if self.power != PowerState::Active {
            return Err(Error::NotActive);
        }
        self.set_window(window).await?;
        self.write_pixels(pixels).await
    }

    /// Read the 4-byte display identification (04h).
    pub async fn read_display_id(&mut self) -> Result<[u8; 4], Error<E>> {
        let mut id = [0u8; 4];
        Self::bus_read(
            &mut self.bus,
            self.config.frequency_hz,
            Instruction::ReadDisplayId as u8,
            &mut id,
        )
        .await?;
        Ok(id)
    }

    /// Fill the whole panel with a single color.
    pub async fn fill_screen(&mut self, color: Rgb565) -> Result<(), Error<E>> {
        self.fill_rect(0, 0, self.config.width, self.config.height, color)
            .await
    }

    /// Fill a rectangular area with a color, streamed through the scratch
    /// buffer. The first chunk is a memory write from the window origin,
    /// continuation chunks keep the write pointer.
    pub async fn fill_rect(
        &mut self,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
        color: Rgb565,
    ) -> Result<(), Error<E>> {
        if self.power != PowerState::Active {
            return Err(Error::NotActive);
        }
        if width == 0 || height == 0 {
            return Ok(());
        }

        let (ex, ey) = match (x.checked_add(width - 1), y.checked_add(height - 1)) {
            (Some(ex), Some(ey)) => (ex, ey),
            _ => return Err(Error::InvalidWindow),
        };
        self.set_window(AddressWindow::new(x, y, ex, ey)).await?;

        let color_bytes = RawU16::from(color).into_inner().to_be_bytes();
        let usable = self.buffer.len() - self.buffer.len() % 2;
        assert!(usable >= 2, "scratch buffer too small");
        for pixel in self.buffer[..usable].chunks_exact_mut(2) {
            pixel[0] = color_bytes[0];
            pixel[1] = color_bytes[1];
        }

        let mut remaining = width as usize * height as usize * 2;
        let mut cmd = Instruction::MemoryWrite as u8;
        while remaining > 0 {
            let len = remaining.min(usable);
            Self::bus_memory(
                &mut self.bus,
                self.config.frequency_hz,
                cmd,
                &self.buffer[..len],
            )
            .await?;
            cmd = Instruction::MemoryWriteContinue as u8;
            remaining -= len;
        }

        Ok(())
    }

    /// Give the transport and reset pin back.
    pub fn release(self) -> (B, RST) {
        (self.bus, self.rst)
    }

    /// Send one register write in short-command framing.
    async fn send_command(&mut self, cmd: u8, params: &[u8]) -> Result<(), Error<E>> {
        Self::bus_command(&mut self.bus, self.config.frequency_hz, cmd, params).await
    }

    /// Send one bulk payload in memory/streaming framing.
    async fn send_bulk(&mut self, cmd: u8, data: &[u8]) -> Result<(), Error<E>> {
        Self::bus_memory(&mut self.bus, self.config.frequency_hz, cmd, data).await
    }

    // Each exchange primitive below performs exactly one bus operation under
    // the acquire -> configure -> operate -> release discipline. The lock is
    // released on every exit path; transport errors propagate verbatim, no
    // retries at this layer.

    async fn bus_command(
        bus: &mut B,
        frequency_hz: u32,
        cmd: u8,
        params: &[u8],
    ) -> Result<(), Error<E>> {
        let data = if params.is_empty() {
            CommandData::None
        } else {
            CommandData::Write(params)
        };
        let op = CommandOp {
            opcode: OP_WRITE_CMD,
            addr: Some((cmd as u32) << 8),
            data,
        };

        bus.lock(true).await.map_err(Error::Comm)?;
        bus.set_word_size(8);
        bus.set_mode(BusMode::Mode0);
        bus.set_frequency(frequency_hz);
        let result = bus.command(op).await;
        let released = bus.lock(false).await;

        result.map_err(Error::Comm)?;
        released.map_err(Error::Comm)
    }

    async fn bus_memory(
        bus: &mut B,
        frequency_hz: u32,
        cmd: u8,
        data: &[u8],
    ) -> Result<(), Error<E>> {
        let op = MemoryOp {
            opcode: OP_WRITE_DATA,
            addr: (cmd as u32) << 8,
            dummies: 0,
            data: MemoryData::Write(data),
        };

        bus.lock(true).await.map_err(Error::Comm)?;
        bus.set_word_size(8);
        bus.set_mode(BusMode::Mode0);
        bus.set_frequency(frequency_hz);
        let result = bus.memory(op).await;
        let released = bus.lock(false).await;

        result.map_err(Error::Comm)?;
        released.map_err(Error::Comm)
    }

    async fn bus_read(
        bus: &mut B,
        frequency_hz: u32,
        cmd: u8,
        buf: &mut [u8],
    ) -> Result<(), Error<E>> {
        let wanted = buf.len();
        let op = CommandOp {
            opcode: OP_READ_CMD,
            addr: Some((cmd as u32) << 8),
            data: CommandData::Read(buf),
        };

        bus.lock(true).await.map_err(Error::Comm)?;
        bus.set_word_size(8);
        bus.set_mode(BusMode::Mode0);
        bus.set_frequency(frequency_hz);
        let result = bus.command(op).await;
        let released = bus.lock(false).await;

        let got = result.map_err(Error::Comm)?;
        released.map_err(Error::Comm)?;
        if got != wanted {
            return Err(Error::ShortRead);
        }
        Ok(())
    }
}

#[maybe_async_cfg::maybe(
    sync(cfg(not(feature = "async")), self = "Timer",),
    async(feature = "async", keep_self)
)]
/// Simplified timer trait for delay operations.
pub trait Timer {
    /// Delay for the specified number of milliseconds.
    async fn delay_ms(milliseconds: u64);
}

/// `Timer` backed by embassy-time.
#[cfg(all(feature = "async", feature = "embassy-time"))]
pub struct EmbassyTimer;

#[cfg(all(feature = "async", feature = "embassy-time"))]
impl Timer for EmbassyTimer {
    async fn delay_ms(milliseconds: u64) {
        embassy_time::Timer::after_millis(milliseconds).await;
    }
}
