use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use crate::error::{SocketError, SocketResult};

/// The fixed set of options a socket supports. All of them configure the connection and can
///  therefore not be changed while a connect attempt is in flight or the socket is connected.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SocketOption {
    /// connect timeout in milliseconds
    ConnectTimeout,
    /// blocking mode for receiving - this includes connect
    ReceiveSync,
    /// blocking mode for sending
    SendSync,
    IsSender,
    TimestampMode,
}
impl SocketOption {
    pub const ALL: [SocketOption; 5] = [
        SocketOption::ConnectTimeout,
        SocketOption::ReceiveSync,
        SocketOption::SendSync,
        SocketOption::IsSender,
        SocketOption::TimestampMode,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SocketOption::ConnectTimeout => "connect_timeout",
            SocketOption::ReceiveSync => "receive_sync",
            SocketOption::SendSync => "send_sync",
            SocketOption::IsSender => "is_sender",
            SocketOption::TimestampMode => "timestamp_mode",
        }
    }
}
impl Display for SocketOption {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
impl FromStr for SocketOption {
    type Err = SocketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketOption::ALL.iter()
            .find(|o| o.name() == s)
            .copied()
            .ok_or_else(|| SocketError::UnknownOption(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OptionValue {
    Int(i64),
    Bool(bool),
}
impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}
impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}
impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        OptionValue::Int(value as i64)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SocketOptions {
    pub connect_timeout: Duration,
    pub receive_sync: bool,
    pub send_sync: bool,
    pub is_sender: bool,
    pub timestamp_mode: bool,
}

impl SocketOptions {
    /// upper bound for `connect_timeout`, matching the range of a signed 32 bit millisecond value
    pub const MAX_CONNECT_TIMEOUT_MILLIS: i64 = i32::MAX as i64;

    pub fn new(default_connect_timeout: Duration) -> SocketOptions {
        SocketOptions {
            connect_timeout: default_connect_timeout,
            receive_sync: true,
            send_sync: true,
            is_sender: false,
            timestamp_mode: false,
        }
    }

    pub fn get(&self, option: SocketOption) -> OptionValue {
        match option {
            SocketOption::ConnectTimeout => OptionValue::Int(self.connect_timeout.as_millis() as i64),
            SocketOption::ReceiveSync => OptionValue::Bool(self.receive_sync),
            SocketOption::SendSync => OptionValue::Bool(self.send_sync),
            SocketOption::IsSender => OptionValue::Bool(self.is_sender),
            SocketOption::TimestampMode => OptionValue::Bool(self.timestamp_mode),
        }
    }

    /// Validates shape and domain of the value. Whether the option may be changed in the socket's
    ///  current state is the caller's concern.
    pub fn set(&mut self, option: SocketOption, value: OptionValue) -> SocketResult<()> {
        match (option, value) {
            (SocketOption::ConnectTimeout, OptionValue::Int(millis)) => {
                if millis <= 0 || millis > Self::MAX_CONNECT_TIMEOUT_MILLIS {
                    return Err(SocketError::InvalidValue {
                        option,
                        reason: format!("{} ms is outside of 1..={}", millis, Self::MAX_CONNECT_TIMEOUT_MILLIS),
                    });
                }
                self.connect_timeout = Duration::from_millis(millis as u64);
            }
            (SocketOption::ReceiveSync, OptionValue::Bool(b)) => self.receive_sync = b,
            (SocketOption::SendSync, OptionValue::Bool(b)) => self.send_sync = b,
            (SocketOption::IsSender, OptionValue::Bool(b)) => self.is_sender = b,
            (SocketOption::TimestampMode, OptionValue::Bool(b)) => self.timestamp_mode = b,
            (_, value) => {
                return Err(SocketError::InvalidValue {
                    option,
                    reason: format!("unexpected value type {:?}", value),
                });
            }
        }
        Ok(())
    }
}
