//! Buffered, non-blocking wrapper around one connected socket, driven by an
//! [`EventLoop`].

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};
use crate::reactor::{EventLoop, EventSet};

/// A connected, byte-oriented socket an [`IOStream`] can own.
///
/// The stream needs readiness-driven reads and writes, the raw descriptor
/// for loop registration, and the ability to switch off blocking.
pub trait StreamSocket: Read + Write + AsRawFd + Send + 'static {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl StreamSocket for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

impl StreamSocket for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }
}

type ReadCallback = Box<dyn FnOnce(StreamResult<Vec<u8>>) + Send>;

enum ReadCondition {
    /// Read through the first occurrence of the delimiter. `scanned` is how
    /// far the buffer has already been searched, so partial arrivals never
    /// trigger a rescan from the front.
    Delimiter { delimiter: Vec<u8>, scanned: usize },
    /// Read exactly this many bytes.
    Bytes(usize),
    /// Read everything until the stream closes.
    UntilClose,
}

struct PendingRead {
    condition: ReadCondition,
    callback: ReadCallback,
}

struct Inner<S> {
    /// Taken on close; dropping it closes the descriptor.
    socket: Option<S>,
    read_buffer: Buffer,
    write_buffer: Buffer,
    pending: Option<PendingRead>,
    /// Interest currently registered with the loop.
    interest: EventSet,
    closed: bool,
}

/// Buffered asynchronous stream over one non-blocking socket.
///
/// At most one read condition may be pending at a time; a second read fails
/// with [`StreamError::AlreadyReading`]. Writes are buffered and drained in
/// FIFO order as the socket accepts them. All callbacks run on the loop
/// thread.
pub struct IOStream<S: StreamSocket> {
    io_loop: Arc<EventLoop>,
    fd: RawFd,
    inner: Mutex<Inner<S>>,
}

impl<S: StreamSocket> IOStream<S> {
    /// Puts `socket` into non-blocking mode and registers it with `io_loop`.
    pub fn new(socket: S, io_loop: Arc<EventLoop>) -> StreamResult<Arc<Self>> {
        socket.set_nonblocking(true)?;
        let fd = socket.as_raw_fd();
        let interest = EventSet::READ | EventSet::ERROR;

        let stream = Arc::new(Self {
            io_loop: io_loop.clone(),
            fd,
            inner: Mutex::new(Inner {
                socket: Some(socket),
                read_buffer: Buffer::new(),
                write_buffer: Buffer::new(),
                pending: None,
                interest,
                closed: false,
            }),
        });

        // the loop keeps only a weak reference, so dropping every user
        // handle lets the stream collect instead of leaking a registration
        let weak = Arc::downgrade(&stream);
        io_loop.add_handler(
            fd,
            move |_fd, events| {
                if let Some(stream) = Weak::upgrade(&weak) {
                    stream.handle_events(events);
                }
            },
            interest,
        )?;
        Ok(stream)
    }

    /// Invokes `callback` exactly once with the bytes from the front of the
    /// buffer through the first occurrence of `delimiter`, inclusive. Bytes
    /// past the delimiter stay buffered for the next read.
    pub fn read_until<D, F>(&self, delimiter: D, callback: F) -> StreamResult<()>
    where
        D: AsRef<[u8]>,
        F: FnOnce(StreamResult<Vec<u8>>) + Send + 'static,
    {
        let delimiter = delimiter.as_ref().to_vec();
        if delimiter.is_empty() {
            return Err(StreamError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty delimiter",
            )));
        }
        self.start_read(
            ReadCondition::Delimiter {
                delimiter,
                scanned: 0,
            },
            Box::new(callback),
        )
    }

    /// Invokes `callback` exactly once with exactly `n` bytes.
    pub fn read_bytes<F>(&self, n: usize, callback: F) -> StreamResult<()>
    where
        F: FnOnce(StreamResult<Vec<u8>>) + Send + 'static,
    {
        self.start_read(ReadCondition::Bytes(n), Box::new(callback))
    }

    /// Invokes `callback` with everything received once the stream closes.
    pub fn read_until_close<F>(&self, callback: F) -> StreamResult<()>
    where
        F: FnOnce(StreamResult<Vec<u8>>) + Send + 'static,
    {
        self.start_read(ReadCondition::UntilClose, Box::new(callback))
    }

    /// Appends `data` to the write buffer and returns immediately. The loop
    /// drains the buffer as the socket accepts bytes.
    pub fn write(&self, data: &[u8]) -> StreamResult<()> {
        let mut inner = self.lock_inner();
        if inner.closed {
            return Err(StreamError::StreamClosed);
        }
        inner.write_buffer.extend(data);
        if !inner.interest.contains(EventSet::WRITE) {
            let interest = inner.interest | EventSet::WRITE;
            self.io_loop.update_handler(self.fd, interest)?;
            inner.interest = interest;
        }
        Ok(())
    }

    /// Deregisters from the loop, closes the socket, and discards both
    /// buffers. An until-close reader receives the buffered remainder; any
    /// other pending read is abandoned. Later operations fail with
    /// [`StreamError::StreamClosed`].
    pub fn close(&self) {
        self.close_with(None);
    }

    /// True while a read condition is pending.
    pub fn reading(&self) -> bool {
        self.lock_inner().pending.is_some()
    }

    /// True while unsent bytes remain buffered.
    pub fn writing(&self) -> bool {
        !self.lock_inner().write_buffer.is_empty()
    }

    pub fn closed(&self) -> bool {
        self.lock_inner().closed
    }

    fn start_read(&self, condition: ReadCondition, callback: ReadCallback) -> StreamResult<()> {
        let satisfied = {
            let mut inner = self.lock_inner();
            if inner.closed {
                return Err(StreamError::StreamClosed);
            }
            if inner.pending.is_some() {
                return Err(StreamError::AlreadyReading);
            }
            inner.pending = Some(PendingRead {
                condition,
                callback,
            });
            // earlier traffic may already satisfy the condition
            Self::try_satisfy(&mut inner)
        };
        if let Some((callback, result)) = satisfied {
            callback(result);
        }
        Ok(())
    }

    fn handle_events(&self, events: EventSet) {
        if events.contains(EventSet::READ) {
            self.handle_read();
        }
        if events.contains(EventSet::WRITE) {
            self.handle_write();
        }
        if events.contains(EventSet::ERROR) {
            log::warn!("error condition on fd {}", self.fd);
            self.close_with(Some(StreamError::ConnectionClosed));
        }
    }

    /// Drains the socket into the read buffer, then re-evaluates the
    /// pending condition. The poll registration is edge-triggered, so the
    /// socket must be read to `WouldBlock` on every event.
    fn handle_read(&self) {
        let mut satisfied = None;
        let mut teardown = None;
        {
            let mut inner = self.lock_inner();
            if inner.closed {
                return;
            }
            let chunk_size = self.io_loop.config().read_chunk_size;
            let max_buffer = self.io_loop.config().max_buffer_size;
            let mut overflow = false;
            {
                let Inner {
                    socket,
                    read_buffer,
                    ..
                } = &mut *inner;
                let socket = match socket.as_mut() {
                    Some(socket) => socket,
                    None => return,
                };
                let mut chunk = vec![0u8; chunk_size];
                loop {
                    match socket.read(&mut chunk) {
                        // zero-length receive: the peer closed
                        Ok(0) => {
                            teardown = Some(StreamError::ConnectionClosed);
                            break;
                        }
                        Ok(n) => {
                            read_buffer.extend(&chunk[..n]);
                            if read_buffer.len() > max_buffer {
                                overflow = true;
                                break;
                            }
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            log::warn!("read error on fd {}: {}", self.fd, err);
                            teardown = Some(StreamError::ConnectionClosed);
                            break;
                        }
                    }
                }
            }
            if overflow {
                log::error!(
                    "fd {}: read buffer exceeded {} bytes, closing stream",
                    self.fd,
                    max_buffer
                );
                teardown = Some(StreamError::BufferCapacityExceeded(max_buffer));
            } else {
                satisfied = Self::try_satisfy(&mut inner);
            }
        }
        // deliver what the bytes already satisfy before tearing down, so
        // data that arrived together with the peer's FIN is not lost
        if let Some((callback, result)) = satisfied {
            callback(result);
        }
        if let Some(reason) = teardown {
            self.close_with(Some(reason));
        }
    }

    /// Sends as much buffered data as the socket accepts; once the buffer
    /// fully drains, WRITE interest is dropped so an idle connection does
    /// not spin the poll.
    fn handle_write(&self) {
        let mut teardown = false;
        {
            let mut inner = self.lock_inner();
            if inner.closed {
                return;
            }
            {
                let Inner {
                    socket,
                    write_buffer,
                    ..
                } = &mut *inner;
                let socket = match socket.as_mut() {
                    Some(socket) => socket,
                    None => return,
                };
                while !write_buffer.is_empty() {
                    match socket.write(write_buffer.as_bytes()) {
                        Ok(0) => {
                            teardown = true;
                            break;
                        }
                        Ok(n) => write_buffer.consume(n),
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            log::warn!("write error on fd {}: {}", self.fd, err);
                            teardown = true;
                            break;
                        }
                    }
                }
            }
            if !teardown && inner.write_buffer.is_empty() && inner.interest.contains(EventSet::WRITE)
            {
                let interest = inner.interest.remove(EventSet::WRITE);
                match self.io_loop.update_handler(self.fd, interest) {
                    Ok(()) => inner.interest = interest,
                    Err(err) => log::debug!("dropping WRITE interest on fd {} failed: {}", self.fd, err),
                }
            }
        }
        if teardown {
            self.close_with(Some(StreamError::ConnectionClosed));
        }
    }

    /// Checks the pending condition against the read buffer; on a match,
    /// consumes exactly the satisfying prefix and hands back the callback
    /// for invocation outside the lock.
    fn try_satisfy(inner: &mut Inner<S>) -> Option<(ReadCallback, StreamResult<Vec<u8>>)> {
        let Inner {
            pending,
            read_buffer,
            ..
        } = inner;
        let active = pending.as_mut()?;

        let take = match &mut active.condition {
            ReadCondition::Delimiter { delimiter, scanned } => {
                // back up so a delimiter straddling two arrivals is found
                let resume = scanned.saturating_sub(delimiter.len() - 1);
                match read_buffer.find_from(delimiter, resume) {
                    Some(at) => Some(at + delimiter.len()),
                    None => {
                        *scanned = read_buffer.len();
                        None
                    }
                }
            }
            ReadCondition::Bytes(n) => {
                if read_buffer.len() >= *n {
                    Some(*n)
                } else {
                    None
                }
            }
            ReadCondition::UntilClose => None,
        }?;

        let data = read_buffer.drain(take);
        pending
            .take()
            .map(|read| (read.callback, Ok(data)))
    }

    /// Tears the stream down. `reason` is `None` for an orderly local
    /// close (a pending delimiter/length read is abandoned) and the error
    /// to signal when the transport failed underneath a pending read.
    fn close_with(&self, reason: Option<StreamError>) {
        let resolution;
        {
            let mut inner = self.lock_inner();
            if inner.closed {
                return;
            }
            inner.closed = true;
            if let Err(err) = self.io_loop.remove_handler(self.fd) {
                log::debug!("removing handler for fd {} failed: {}", self.fd, err);
            }
            resolution = match inner.pending.take() {
                Some(PendingRead {
                    condition: ReadCondition::UntilClose,
                    callback,
                }) => Some((callback, Ok(inner.read_buffer.take_all()))),
                Some(PendingRead { callback, .. }) => {
                    reason.map(|err| (callback, Err(err)))
                }
                None => None,
            };
            inner.read_buffer.clear();
            inner.write_buffer.clear();
            // dropping the socket closes the descriptor
            inner.socket = None;
        }
        if let Some((callback, result)) = resolution {
            callback(result);
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner<S>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<S: StreamSocket> Drop for IOStream<S> {
    fn drop(&mut self) {
        let closed = match self.inner.get_mut() {
            Ok(inner) => inner.closed,
            Err(poisoned) => poisoned.into_inner().closed,
        };
        if !closed {
            let _ = self.io_loop.remove_handler(self.fd);
        }
    }
}
