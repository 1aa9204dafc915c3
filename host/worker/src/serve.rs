use futures::{
    StreamExt as _,
    channel::mpsc::{UnboundedReceiver, UnboundedSender},
};
use seclink_protocol::{
    Request, Response,
    codec::{recv_frame, send_message, wrap_stream_rx, wrap_stream_tx},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{Instrument as _, debug, info_span, warn};

use crate::Dispatcher;

/// Runs a dispatcher on the current thread until the client hangs up. Dropping the dispatcher on
/// the way out releases a native context that was never destroyed.
pub fn run_worker(
    mut dispatcher: Dispatcher,
    requests: UnboundedReceiver<Request>,
    responses: UnboundedSender<Response>,
) {
    let _span = info_span!("seclink worker").entered();

    smol::block_on(serve_channel(&mut dispatcher, requests, responses));

    debug!("worker loop exited");
}

/// Answers requests from `requests` one at a time until the channel closes. A destroyed
/// dispatcher keeps answering: repeated destroys succeed and calls fail.
pub async fn serve_channel(
    dispatcher: &mut Dispatcher,
    mut requests: UnboundedReceiver<Request>,
    responses: UnboundedSender<Response>,
) {
    while let Some(req) = requests.next().await {
        let res = dispatcher.handle(req);

        if responses.unbounded_send(res).is_err() {
            warn!("client went away before receiving its response");
            break;
        }
    }
}

/// Serves a dispatcher over a framed byte stream until end-of-stream.
pub async fn serve_stream(
    dispatcher: &mut Dispatcher,
    reader: impl AsyncRead + Unpin,
    writer: impl AsyncWrite + Unpin,
    max_frame_size: u32,
) -> anyhow::Result<()> {
    let mut rx = wrap_stream_rx(reader, max_frame_size);
    let mut tx = wrap_stream_tx(writer);

    async move {
        while let Some(frame) = recv_frame(&mut rx).await? {
            let res = dispatcher.handle_frame(&frame);
            send_message(&mut tx, &res).await?;
        }

        debug!("stream closed");

        Ok(())
    }
    .instrument(info_span!("seclink stream"))
    .await
}
