//! 原始双工字节流抽象与就绪等待。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 会话层只要求底层是“可读可写的非阻塞字节流”，并能在 `WouldBlock` 之后等待可读/可写；
//! - 把就绪等待收敛到 [`Transport::wait`]，握手状态机与具体事件循环解耦：
//!   调用方既可以自行 `poll`，也可以使用会话提供的阻塞式辅助方法。
//!
//! ## 契约（What）
//! - 实现者必须处于非阻塞模式，`read`/`write` 在无法推进时返回 `io::ErrorKind::WouldBlock`；
//! - `wait` 返回 `Ok(true)` 表示已就绪（或出现挂断/错误事件，后续读写会暴露具体原因），
//!   `Ok(false)` 表示超时。
//!
//! ## 实现（How）
//! - Unix 平台借助 `nix::poll` 对借用的文件描述符做一次性等待，`EINTR` 时重试。

use std::{
    fmt,
    io::{self, Read, Write},
    time::Duration,
};

/// 等待方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Interest {
    /// 等待可读。
    Read,
    /// 等待可写。
    Write,
    /// 任一方向就绪即可。
    ReadWrite,
}

impl Interest {
    /// 是否包含可读方向。
    pub const fn is_readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// 是否包含可写方向。
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    /// 合并两个方向。
    pub const fn union(self, other: Interest) -> Interest {
        match (
            self.is_readable() || other.is_readable(),
            self.is_writable() || other.is_writable(),
        ) {
            (true, true) => Self::ReadWrite,
            (false, true) => Self::Write,
            _ => Self::Read,
        }
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "need-read",
            Self::Write => "need-write",
            Self::ReadWrite => "need-read-write",
        })
    }
}

/// 会话绑定的原始双工字节流。
pub trait Transport: Read + Write + Send {
    /// 阻塞等待指定方向就绪；`timeout` 为 `None` 时无限等待。
    fn wait(&self, interest: Interest, timeout: Option<Duration>) -> io::Result<bool>;
}

#[cfg(unix)]
mod unix {
    use std::{
        io,
        net::TcpStream,
        os::{fd::AsFd, unix::net::UnixStream},
        time::Duration,
    };

    use nix::{
        errno::Errno,
        poll::{PollFd, PollFlags, PollTimeout, poll},
    };

    use super::{Interest, Transport};

    pub(crate) fn wait_fd(
        source: &impl AsFd,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> io::Result<bool> {
        let mut flags = PollFlags::empty();
        if interest.is_readable() {
            flags |= PollFlags::POLLIN;
        }
        if interest.is_writable() {
            flags |= PollFlags::POLLOUT;
        }
        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(duration) => PollTimeout::try_from(duration).unwrap_or(PollTimeout::MAX),
        };
        let mut fds = [PollFd::new(source.as_fd(), flags)];
        loop {
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(io::Error::from(errno)),
            }
        }
    }

    macro_rules! fd_transport {
        ($($ty:ty),+ $(,)?) => {
            $(
                impl Transport for $ty {
                    fn wait(&self, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
                        wait_fd(self, interest, timeout)
                    }
                }
            )+
        };
    }

    fd_transport!(UnixStream, TcpStream);
}
