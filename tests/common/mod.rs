//! Shared fixtures: a recording stream reader and an in-memory transport
//! that wires a `Client` straight into a `ServerDispatcher`.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::StatusCode;

use flowgate::stream::buffered::{byte_stream, read_full};
use flowgate::stream::{ReadHandle, Reader};
use flowgate::transport::BoxFuture;
use flowgate::{
    Client, Connection, ConnectionFactory, Error, RequestContext, ServerDispatcher,
    StreamHandler, StreamRequest, StreamResponse, TransportConfig,
};

/// Everything a [`RecordingReader`] observed, shared with the test body.
#[derive(Default)]
pub struct StreamRecord {
    chunks: Mutex<Vec<Bytes>>,
    done: AtomicU32,
    errors: Mutex<Vec<Error>>,
    handle: Mutex<Option<ReadHandle>>,
}

impl StreamRecord {
    pub fn body(&self) -> Vec<u8> {
        self.chunks
            .lock()
            .unwrap()
            .iter()
            .flat_map(|c| c.iter().copied())
            .collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    pub fn done_count(&self) -> u32 {
        self.done.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().unwrap().clone()
    }

    pub fn terminal_count(&self) -> usize {
        self.done_count() as usize + self.errors.lock().unwrap().len()
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.handle.lock().unwrap().as_ref() {
            handle.cancel();
        }
    }

    pub fn request(&self, n: u64) {
        if let Some(handle) = self.handle.lock().unwrap().as_ref() {
            handle.request(n);
        }
    }
}

/// Reader that grants an initial credit window, tops it up one-for-one,
/// and records everything it sees.
pub struct RecordingReader {
    record: Arc<StreamRecord>,
    window: u64,
}

impl Reader for RecordingReader {
    fn on_init(&mut self, handle: ReadHandle) {
        *self.record.handle.lock().unwrap() = Some(handle.clone());
        handle.request(self.window);
    }

    fn on_data(&mut self, chunk: Bytes) {
        self.record.chunks.lock().unwrap().push(chunk);
        self.record.request(1);
    }

    fn on_done(&mut self) {
        self.record.done.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&mut self, err: Error) {
        self.record.errors.lock().unwrap().push(err);
    }
}

pub fn recording_reader(window: u64) -> (RecordingReader, Arc<StreamRecord>) {
    let record = Arc::new(StreamRecord::default());
    (
        RecordingReader {
            record: Arc::clone(&record),
            window,
        },
        record,
    )
}

/// Connection that hands requests straight to a server dispatcher.
pub struct LoopbackConnection {
    server: Arc<ServerDispatcher>,
    open: AtomicBool,
}

impl Connection for LoopbackConnection {
    fn exchange(&self, request: StreamRequest) -> BoxFuture<'_, Result<StreamResponse, Error>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(Error::Connection("connection closed".into()));
            }
            Ok(self.server.dispatch(request).await)
        })
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub struct LoopbackFactory {
    server: Arc<ServerDispatcher>,
    pub connects: AtomicU32,
}

impl ConnectionFactory for LoopbackFactory {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>, Error>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(LoopbackConnection {
                server: Arc::clone(&self.server),
                open: AtomicBool::new(true),
            }) as Arc<dyn Connection>)
        })
    }
}

/// Factory alone, for tests that drive the pool directly.
pub fn loopback_factory(
    handler: Arc<dyn StreamHandler>,
    config: TransportConfig,
) -> Arc<LoopbackFactory> {
    let server = Arc::new(ServerDispatcher::new(handler, config));
    Arc::new(LoopbackFactory {
        server,
        connects: AtomicU32::new(0),
    })
}

/// Build a client whose connections all loop back into `handler`.
pub fn loopback_client(
    handler: Arc<dyn StreamHandler>,
    config: TransportConfig,
) -> (Arc<Client>, Arc<LoopbackFactory>) {
    let server = Arc::new(ServerDispatcher::new(handler, config.clone()));
    let factory = Arc::new(LoopbackFactory {
        server,
        connects: AtomicU32::new(0),
    });
    let client = Arc::new(Client::new(
        Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
        config,
    ));
    (client, factory)
}

/// Handler that buffers the request body and echoes it back.
pub struct EchoHandler;

impl StreamHandler for EchoHandler {
    fn handle(
        &self,
        request: StreamRequest,
        _ctx: RequestContext,
    ) -> BoxFuture<'static, Result<StreamResponse, Error>> {
        Box::pin(async move {
            let body = read_full(&request.body, None).await?;
            Ok(StreamResponse::new(StatusCode::OK, byte_stream(body)))
        })
    }
}
