//! Network plumbing: wire framing and protocol command codes.

pub mod frame;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Outbound queue handle for one connection. Any number of producers may
/// enqueue encoded frames; the session's writer half drains them.
pub type OutboundTx = mpsc::UnboundedSender<Bytes>;
pub type OutboundRx = mpsc::UnboundedReceiver<Bytes>;

/// Protocol command codes carried in the frame header.
pub mod cmd {
    // client -> server
    pub const CS_CONFIRM_DIALOG: u16 = 0x0001;
    pub const CS_PING: u16 = 0x0002;
    pub const CS_LEAVE: u16 = 0x0003;
    pub const CS_WALK: u16 = 0x0010;
    pub const CS_RUN: u16 = 0x0011;
    pub const CS_TURN: u16 = 0x0012;
    pub const CS_STOP: u16 = 0x0013;
    pub const CS_ATTACK: u16 = 0x0020;
    pub const CS_CHAT: u16 = 0x0030;
    pub const CS_WHISPER: u16 = 0x0031;
    pub const CS_PICKUP: u16 = 0x0040;
    pub const CS_DROP: u16 = 0x0041;
    pub const CS_EQUIP: u16 = 0x0042;
    pub const CS_UNEQUIP: u16 = 0x0043;
    pub const CS_USE_ITEM: u16 = 0x0044;

    // server -> client
    pub const SC_FIRST_DIALOG: u16 = 0x0100;
    pub const SC_APPEAR: u16 = 0x0101;
    pub const SC_VANISH: u16 = 0x0102;
    pub const SC_MOVE: u16 = 0x0103;
    pub const SC_TURN: u16 = 0x0104;
    pub const SC_CLEAR_OBJECTS: u16 = 0x0105;
    pub const SC_CHAT: u16 = 0x0110;
    pub const SC_ATTACK: u16 = 0x0111;
    pub const SC_DAMAGE: u16 = 0x0112;
    pub const SC_LOOK_CHANGE: u16 = 0x0113;
    pub const SC_SYSTEM_MESSAGE: u16 = 0x0120;
    pub const SC_PONG: u16 = 0x0121;
    pub const SC_UNRECOGNIZED: u16 = 0x01FF;
}
