//! Fixed-size action heads.
//!
//! Every action starts with a one-byte tag followed by a head whose shape
//! depends on the tag. All integers are big endian. Head layouts:
//!
//! ```text
//! Action (0x00):      handler_id:u16 message_id:u16 send_time:u64
//!                     data_type:u8 compressor:u8 data_len:u32    = 18 B
//! StreamAction (0x01): same without data_len                      = 14 B
//! InputAction (0x02): message_id:u16 data_type:u8 compressor:u8
//!                     data_len:u32                                = 8 B
//! DownloadSpeed (0x05): speed:u32                                 = 4 B
//! CancelInput (0x06): message_id:u16                              = 2 B
//! Ping (0xFF):        send_time:u64                               = 8 B
//! ```

/// Head of a request/response `Action` (`0x00`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionHead {
    pub handler_id: u16,
    pub message_id: u16,
    pub send_time: u64,
    pub data_type: u8,
    pub compressor: u8,
    pub data_len: u32,
}

/// Size of [`ActionHead`] on the wire.
pub const ACTION_HEAD_LEN: usize = 18;

impl ActionHead {
    pub fn encode(&self) -> [u8; ACTION_HEAD_LEN] {
        let mut buf = [0u8; ACTION_HEAD_LEN];
        buf[0..2].copy_from_slice(&self.handler_id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.message_id.to_be_bytes());
        buf[4..12].copy_from_slice(&self.send_time.to_be_bytes());
        buf[12] = self.data_type;
        buf[13] = self.compressor;
        buf[14..18].copy_from_slice(&self.data_len.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; ACTION_HEAD_LEN]) -> Self {
        Self {
            handler_id: u16::from_be_bytes([buf[0], buf[1]]),
            message_id: u16::from_be_bytes([buf[2], buf[3]]),
            send_time: u64::from_be_bytes(buf[4..12].try_into().expect("length checked")),
            data_type: buf[12],
            compressor: buf[13],
            data_len: u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]),
        }
    }
}

/// Head of a `StreamAction` (`0x01`); the payload length is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHead {
    pub handler_id: u16,
    pub message_id: u16,
    pub send_time: u64,
    pub data_type: u8,
    pub compressor: u8,
}

/// Size of [`StreamHead`] on the wire.
pub const STREAM_HEAD_LEN: usize = 14;

impl StreamHead {
    pub fn encode(&self) -> [u8; STREAM_HEAD_LEN] {
        let mut buf = [0u8; STREAM_HEAD_LEN];
        buf[0..2].copy_from_slice(&self.handler_id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.message_id.to_be_bytes());
        buf[4..12].copy_from_slice(&self.send_time.to_be_bytes());
        buf[12] = self.data_type;
        buf[13] = self.compressor;
        buf
    }

    pub fn decode(buf: &[u8; STREAM_HEAD_LEN]) -> Self {
        Self {
            handler_id: u16::from_be_bytes([buf[0], buf[1]]),
            message_id: u16::from_be_bytes([buf[2], buf[3]]),
            send_time: u64::from_be_bytes(buf[4..12].try_into().expect("length checked")),
            data_type: buf[12],
            compressor: buf[13],
        }
    }
}

/// Head of an `InputAction` (`0x02`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputHead {
    pub message_id: u16,
    pub data_type: u8,
    pub compressor: u8,
    pub data_len: u32,
}

/// Size of [`InputHead`] on the wire.
pub const INPUT_HEAD_LEN: usize = 8;

impl InputHead {
    pub fn encode(&self) -> [u8; INPUT_HEAD_LEN] {
        let mut buf = [0u8; INPUT_HEAD_LEN];
        buf[0..2].copy_from_slice(&self.message_id.to_be_bytes());
        buf[2] = self.data_type;
        buf[3] = self.compressor;
        buf[4..8].copy_from_slice(&self.data_len.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; INPUT_HEAD_LEN]) -> Self {
        Self {
            message_id: u16::from_be_bytes([buf[0], buf[1]]),
            data_type: buf[2],
            compressor: buf[3],
            data_len: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}
