//-
// Copyright (c) 2026, Postern Developers
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3  of the License, or (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task;

use openssl::ssl::{SslAcceptor, SslStream};
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf};

use crate::support::error::Error;

/// The transport a session reads commands from and writes replies to.
///
/// A `SessionIo` starts out in cleartext and can be switched to TLS
/// mid-stream by `upgrade_tls`, which is how STARTTLS swaps the transport
/// without dropping the connection: the session holds the same `SessionIo`
/// throughout and only the shared mode inside it changes, so no command can
/// be dispatched against a stale transport.
///
/// Clones of `SessionIo` track the same underlying state.
#[derive(Clone)]
pub struct SessionIo {
    fd: Rc<AsyncFd<RawFd>>,
    transport: Rc<RefCell<Transport>>,
    _owned: Option<Rc<dyn Any>>,
}

enum Transport {
    Plain(FdIo),
    Tls(SslStream<FdIo>),
}

impl SessionIo {
    /// Sets up a `SessionIo` which runs over the given socket.
    ///
    /// The `SessionIo` will own the socket, and the socket will be closed
    /// when the last reference is dropped.
    ///
    /// This only fails if making the socket non-blocking fails.
    pub fn new_owned_socket(
        sock: impl AsRawFd + Any,
    ) -> Result<Self, nix::Error> {
        let raw = sock.as_raw_fd();
        nix::fcntl::fcntl(
            raw,
            nix::fcntl::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let fd = Rc::new(
            AsyncFd::with_interest(
                raw,
                tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            )
            .unwrap(),
        );

        Ok(Self {
            fd: Rc::clone(&fd),
            transport: Rc::new(RefCell::new(Transport::Plain(FdIo(fd)))),
            _owned: Some(Rc::new(sock)),
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(*self.transport.borrow(), Transport::Tls(_))
    }

    /// A description of the negotiated TLS session, if there is one.
    pub fn tls_string(&self) -> Option<String> {
        match *self.transport.borrow() {
            Transport::Plain(..) => None,
            Transport::Tls(ref stream) => {
                let ssl = stream.ssl();
                let cipher = ssl.current_cipher();
                Some(format!(
                    "{tls_version}:{cipher}:{strength}",
                    tls_version = ssl.version_str(),
                    cipher = cipher.map_or("NONE", |c| c.name()),
                    strength = cipher.map_or(0, |c| c.bits().algorithm),
                ))
            },
        }
    }

    /// Performs the server-side TLS handshake and switches the transport to
    /// the encrypted stream.
    ///
    /// During the handshake, concurrent calls to other methods will panic.
    pub async fn upgrade_tls(
        &self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        // Borrow the transport for the whole exchange so that concurrent
        // access panics instead of dispatching against a half-built stream.
        #[allow(clippy::await_holding_refcell_ref)] // intentional
        let mut transport = self.transport.borrow_mut();
        let mut result = acceptor.accept(FdIo(Rc::clone(&self.fd)));

        // OpenSSL only tells us which direction it is blocked on after a
        // pass through the handshake, and Tokio only hands out readiness
        // guards once it believes the fd is ready. So: run a handshake pass,
        // and on WANT_READ/WANT_WRITE clear the stale guard from the
        // previous round and wait for fresh readiness before trying again.
        let mut read_guard: Option<
            tokio::io::unix::AsyncFdReadyGuard<'_, RawFd>,
        > = None;
        let mut write_guard: Option<
            tokio::io::unix::AsyncFdReadyGuard<'_, RawFd>,
        > = None;

        loop {
            match result {
                Ok(stream) => {
                    *transport = Transport::Tls(stream);
                    return Ok(());
                },

                Err(openssl::ssl::HandshakeError::SetupFailure(e)) => {
                    return Err(e.into());
                },

                Err(openssl::ssl::HandshakeError::Failure(mhss)) => {
                    return Err(handshake_error(mhss));
                },

                Err(openssl::ssl::HandshakeError::WouldBlock(mhss)) => {
                    match mhss.error().code() {
                        openssl::ssl::ErrorCode::WANT_READ => {
                            if let Some(mut guard) = read_guard.take() {
                                guard.clear_ready();
                            }

                            read_guard = Some(self.fd.readable().await?);
                            result = mhss.handshake();
                        },

                        openssl::ssl::ErrorCode::WANT_WRITE => {
                            if let Some(mut guard) = write_guard.take() {
                                guard.clear_ready();
                            }

                            write_guard = Some(self.fd.writable().await?);
                            result = mhss.handshake();
                        },

                        _ => return Err(handshake_error(mhss)),
                    }
                },
            }
        }
    }

    /// Called when an error is returned from `ssl_read` or `ssl_write`.
    ///
    /// Handles WANT_READ/WANT_WRITE by arranging a readiness check for the
    /// fd and clearing its currently-set readiness. Must only be called
    /// immediately after `ssl_read`/`ssl_write` with no await points in
    /// between, so the WANT status still reflects the socket.
    fn on_tls_io_error(
        &self,
        ctx: &mut task::Context<'_>,
        e: openssl::ssl::Error,
    ) -> task::Poll<io::Result<()>> {
        match e.code() {
            openssl::ssl::ErrorCode::WANT_READ => {
                futures::ready!(self.fd.poll_read_ready(ctx))?.clear_ready();
                // Call again to get tokio to actually watch for more changes.
                futures::ready!(self.fd.poll_read_ready(ctx))?.retain_ready();
                // If we get here, the fd has somehow become ready meanwhile.
                task::Poll::Ready(Ok(()))
            },

            openssl::ssl::ErrorCode::WANT_WRITE => {
                futures::ready!(self.fd.poll_write_ready(ctx))?.clear_ready();
                futures::ready!(self.fd.poll_write_ready(ctx))?.retain_ready();
                task::Poll::Ready(Ok(()))
            },

            // EOF is represented by the SYSCALL error code with no
            // associated IO error, which into_io_error() does not translate.
            openssl::ssl::ErrorCode::SYSCALL => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

            _ => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
        }
    }
}

impl AsyncRead for SessionIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut transport = self.transport.borrow_mut();
        match *transport {
            Transport::Plain(ref mut f) => Pin::new(f).poll_read(ctx, buf),
            Transport::Tls(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => {
                        futures::ready!(self.on_tls_io_error(ctx, e))?
                    },
                }
            },
        }
    }
}

impl AsyncWrite for SessionIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let mut transport = self.transport.borrow_mut();
        match *transport {
            Transport::Plain(ref mut f) => Pin::new(f).poll_write(ctx, buf),
            Transport::Tls(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => {
                        futures::ready!(self.on_tls_io_error(ctx, e))?
                    },
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // OpenSSL does not buffer writes itself and neither do we, so there
        // is nothing to do.
        task::Poll::Ready(Ok(()))
    }

    /// If there is a TLS session, the session is shut down, returning the
    /// socket to cleartext.
    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut transport = self.transport.borrow_mut();
        let done = if let Transport::Tls(ref mut ssl) = *transport {
            loop {
                match ssl.shutdown() {
                    Ok(openssl::ssl::ShutdownResult::Received) => break,
                    Ok(openssl::ssl::ShutdownResult::Sent) => {
                        return task::Poll::Pending;
                    },

                    Err(e) => {
                        futures::ready!(self.on_tls_io_error(ctx, e))?
                    },
                }
            }

            true
        } else {
            false
        };

        if done {
            *transport = Transport::Plain(FdIo(Rc::clone(&self.fd)));
        }

        task::Poll::Ready(Ok(()))
    }
}

/// Implements both the synchronous and asynchronous read and write traits
/// atop the raw file descriptor.
///
/// The synchronous pair is what OpenSSL drives during handshakes and record
/// processing; the asynchronous pair backs the cleartext mode.
struct FdIo(Rc<AsyncFd<RawFd>>);

impl io::Read for FdIo {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(*self.0.get_ref(), dst).map_err(nix_to_io)
    }
}

impl io::Write for FdIo {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        nix::unistd::write(*self.0.get_ref(), src).map_err(nix_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncRead for FdIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_read_ready(ctx))?;

            match guard.try_io(|fd| {
                nix::unistd::read(*fd.get_ref(), buf.initialize_unfilled())
                    .map_err(nix_to_io)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return task::Poll::Ready(Ok(()));
                },

                Ok(Err(e)) => return task::Poll::Ready(Err(e)),

                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for FdIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_write_ready(ctx))?;

            if let Ok(result) = guard.try_io(|fd| {
                nix::unistd::write(*fd.get_ref(), buf).map_err(nix_to_io)
            }) {
                return task::Poll::Ready(result);
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn handshake_error(
    mhss: openssl::ssl::MidHandshakeSslStream<FdIo>,
) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == openssl::ssl::ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
