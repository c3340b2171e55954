//! 终端 I/O 桥
//!
//! 把 PTY master 描述符注册到 tokio reactor，在可读时非阻塞读取，
//! 并把客户端输入写回描述符。读写出错都视为子进程已退出，之后不再读写。
//!
//! 写入从不等待：终端暂时不接收的输入留在待写缓冲区，由 `read_chunk`
//! 在描述符可写时顺带写出。缓冲区有上限，超出的输入被丢弃。

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// 待写输入的上限
pub const MAX_PENDING_INPUT: usize = 1024 * 1024;

/// 终端 I/O 桥
pub struct TerminalBridge {
    fd: Option<AsyncFd<File>>,
    buf: Vec<u8>,
    /// 终端尚未接收的输入，按提交顺序写出
    pending: Vec<u8>,
    /// 读写已出错，桥不能再使用
    failed: bool,
}

impl TerminalBridge {
    /// 注册描述符
    ///
    /// 描述符被设为非阻塞并由桥独占，detach 或 drop 时关闭。
    pub fn attach(descriptor: OwnedFd, chunk_size: usize) -> io::Result<Self> {
        set_nonblocking(descriptor.as_fd())?;
        let raw = descriptor.as_raw_fd();
        let fd = AsyncFd::with_interest(
            File::from(descriptor),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        tracing::debug!("终端描述符已注册: fd {}", raw);

        Ok(Self {
            fd: Some(fd),
            buf: vec![0u8; chunk_size.max(1)],
            pending: Vec::new(),
            failed: false,
        })
    }

    /// 是否仍注册在 reactor 上
    pub fn is_attached(&self) -> bool {
        self.fd.is_some()
    }

    /// 尚未写入终端的输入字节数
    pub fn pending_input(&self) -> usize {
        self.pending.len()
    }

    /// 等待并读取下一段输出，同时写出待写输入
    ///
    /// 对端关闭时返回 `UnexpectedEof`。出错后桥被标记为失败，
    /// 之后的读写都返回 `NotConnected`。
    pub async fn read_chunk(&mut self) -> io::Result<String> {
        Self::check_usable(self.failed)?;
        let fd = self.fd.as_ref().ok_or_else(closed_error)?;

        loop {
            if !self.pending.is_empty() {
                let guard = tokio::select! {
                    biased;
                    guard = fd.readable() => Err(guard?),
                    guard = fd.writable() => Ok(guard?),
                };
                if let Ok(mut guard) = guard {
                    let pending = &mut self.pending;
                    match guard.try_io(|inner| flush_pending(inner.get_ref(), pending)) {
                        Ok(Ok(())) => {
                            tracing::trace!("待写输入已全部写出");
                            continue;
                        }
                        Ok(Err(e)) => {
                            self.failed = true;
                            return Err(e);
                        }
                        Err(_would_block) => continue,
                    }
                }
            }

            let mut guard = fd.readable().await?;
            let result = guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(&mut self.buf)
            });

            match result {
                Ok(Ok(0)) => {
                    self.failed = true;
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "终端已关闭"));
                }
                Ok(Ok(n)) => return Ok(decode_lossy(&self.buf[..n])),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => {
                    self.failed = true;
                    return Err(e);
                }
                // 伪就绪，readiness 已被清除
                Err(_would_block) => continue,
            }
        }
    }

    /// 写入客户端输入（UTF-8）
    ///
    /// 只做一次非阻塞写入，终端暂时不接收的部分留待 `read_chunk` 写出。
    /// 待写缓冲区已满时丢弃超出部分。
    pub fn write(&mut self, data: &str) -> io::Result<()> {
        Self::check_usable(self.failed)?;
        let fd = self.fd.as_ref().ok_or_else(closed_error)?;

        let bytes = data.as_bytes();
        let room = MAX_PENDING_INPUT.saturating_sub(self.pending.len());
        if bytes.len() > room {
            tracing::warn!(
                "终端未及时接收输入，丢弃 {} 字节",
                bytes.len() - room
            );
        }
        self.pending.extend_from_slice(&bytes[..bytes.len().min(room)]);

        match flush_pending(fd.get_ref(), &mut self.pending) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::debug!("终端暂不可写，{} 字节待写", self.pending.len());
                Ok(())
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    /// 注销并关闭描述符，可重复调用
    pub fn detach(&mut self) {
        match self.fd.take() {
            Some(fd) => {
                let raw = fd.as_raw_fd();
                // 先从 reactor 注销，再关闭
                let file = fd.into_inner();
                drop(file);
                tracing::debug!("终端描述符已关闭: fd {}", raw);
            }
            None => tracing::trace!("终端描述符已关闭，忽略重复 detach"),
        }
    }

    fn check_usable(failed: bool) -> io::Result<()> {
        if failed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "终端读写已失败"));
        }
        Ok(())
    }
}

impl Drop for TerminalBridge {
    fn drop(&mut self) {
        self.detach();
    }
}

/// 尽量写出待写输入，写出的部分从缓冲区移除
fn flush_pending(mut file: &File, pending: &mut Vec<u8>) -> io::Result<()> {
    while !pending.is_empty() {
        match file.write(pending) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "终端不再接收输入"));
            }
            Ok(n) => {
                pending.drain(..n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "终端描述符已关闭")
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

/// 按 UTF-8 解码，无法解码的字节替换为 U+FFFD
pub fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
