use std::time::Duration;

use tokio::{
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};

use crate::{
    constants::FLUSH_RETRY_MS,
    error::Result,
    session::{SessionHandler, SessionState, TransportSession},
    transport::{CloseReason, Transport, TransportEvent},
};

/// Pumps transport events into `session` until it reaches
/// [`SessionState::Closed`].
///
/// While outbound bytes are held back by backpressure the flush is retried on
/// a short tick. A dropped event channel counts as an abnormal close.
pub async fn drive<T, H>(
    session: &mut TransportSession<T>,
    handler: &mut H,
    events: &mut mpsc::Receiver<TransportEvent>,
) -> Result<()>
where
    T: Transport,
    H: SessionHandler<T>,
{
    let mut retry = interval(Duration::from_millis(FLUSH_RETRY_MS));
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while session.state() != SessionState::Closed {
        let pending = session.has_pending_send();
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => session.dispatch(event, handler)?,
                None => session.on_close(CloseReason::abnormal("transport went away"), handler)?,
            },
            _ = retry.tick(), if pending => {
                session.flush()?;
            }
        }
    }
    Ok(())
}
