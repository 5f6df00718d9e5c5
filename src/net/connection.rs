use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{error, trace, Instrument};

use crate::net::error::NetError;
use crate::net::frame::{self, Frame};
use crate::net::server::MessageHandler;

const INITIAL_BUFFER_SIZE: usize = 8 * 1024;

/// One client socket: decodes request frames, hands them to the handler and
/// writes back exactly one response frame per request, in order.
pub struct Connection<H>
where
    H: MessageHandler,
{
    id: u64,
    stream: TcpStream,
    handler: H,
    read_buf: BytesMut,
    write_buf: BytesMut,
    shutdown: watch::Receiver<bool>,
}

impl<H> Connection<H>
where
    H: MessageHandler,
{
    pub fn new(id: u64, stream: TcpStream, handler: H, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            id,
            stream,
            handler,
            read_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let span = tracing::info_span!("connection", conn_id = self.id);
        async move {
            if let Err(err) = self.run_inner().await {
                error!("connection {} error: {}", self.id, err);
            }
            trace!("connection {} closed", self.id);
        }
        .instrument(span)
        .await
    }

    async fn run_inner(&mut self) -> Result<(), NetError> {
        if *self.shutdown.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                read_result = self.stream.read_buf(&mut self.read_buf) => {
                    let n = read_result?;
                    if n == 0 {
                        return Ok(());
                    }

                    while let Some(frame) = frame::try_decode_frame(&mut self.read_buf)? {
                        self.process_frame(frame).await?;
                    }
                }
                _ = self.shutdown.changed() => {
                    return Ok(());
                }
            }
        }
    }

    async fn process_frame(&mut self, frame: Frame) -> Result<(), NetError> {
        trace!(msg_type = ?frame.msg_type, correlation_id = frame.correlation_id, "request");
        let response = self.handler.handle_frame(self.id, frame).await?;
        frame::encode_frame(&response, &mut self.write_buf)?;
        self.flush_write_buffer().await
    }

    async fn flush_write_buffer(&mut self) -> Result<(), NetError> {
        while !self.write_buf.is_empty() {
            let n = self.stream.write(&self.write_buf).await?;
            if n == 0 {
                return Err(NetError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write frame",
                )));
            }
            self.write_buf.advance(n);
        }

        self.stream.flush().await?;
        Ok(())
    }
}
