//! Per-connection protocol driver.
//!
//! A connection cycles through
//! `await header -> receive batch -> store batch -> ack` until the client
//! flags its last batch. It then names its agency, waits on the completion
//! barrier, receives that agency's winners, and the connection ends.
//!
//! A peer that hangs up anywhere in the cycle ends the connection quietly.
//! A malformed or oversized record aborts the whole connection before
//! anything from its batch reaches the store.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::{
    bet::{encode_winners, BatchHeader, Bet, ACK},
    error::{ProtocolError, Result},
    framing::{read_exact, read_u32, read_u8, write_all},
    server::LotteryState,
    winners::winners_for,
};

/// Largest record a client may declare, matching the client's batch budget.
pub const MAX_RECORD_LEN: usize = 8 * 1024;

/// Drives one client connection to completion.
///
/// `Ok(())` covers both a finished exchange and a peer that went away early;
/// the caller closes the stream either way.
pub async fn handle_connection<S>(stream: &mut S, state: &LotteryState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let Some(header) = await_batch_header(stream).await? else {
            debug!("peer closed the connection");
            return Ok(());
        };

        let Some(bets) = receive_batch(stream, header.count).await? else {
            debug!(expected = header.count, "peer closed mid-batch, batch discarded");
            return Ok(());
        };
        info!(count = bets.len(), "batch received");

        store_batch(state, &bets).await?;
        write_all(stream, ACK).await?;

        if header.last {
            break;
        }
    }

    let Some(agency) = read_agency(stream).await? else {
        debug!("peer closed before naming its agency");
        return Ok(());
    };

    state.barrier.register_done_and_wait(agency).await;
    deliver_winners(stream, state, agency).await
}

async fn await_batch_header<R>(reader: &mut R) -> Result<Option<BatchHeader>>
where
    R: AsyncRead + Unpin,
{
    let Some(eof_flag) = read_u8(reader).await? else {
        return Ok(None);
    };
    let Some(count) = read_u8(reader).await? else {
        return Ok(None);
    };
    Ok(Some(BatchHeader::from_bytes(eof_flag, count)))
}

/// Reads and decodes `count` length-prefixed records.
async fn receive_batch<R>(reader: &mut R, count: u8) -> Result<Option<Vec<Bet>>>
where
    R: AsyncRead + Unpin,
{
    let mut bets = Vec::with_capacity(count.into());
    for _ in 0..count {
        let Some(len) = read_u32(reader).await? else {
            return Ok(None);
        };
        let len = len as usize;
        if len > MAX_RECORD_LEN {
            return Err(ProtocolError::RecordTooLarge {
                len,
                max: MAX_RECORD_LEN,
            });
        }
        let Some(record) = read_exact(reader, len).await? else {
            return Ok(None);
        };
        bets.push(Bet::decode(&record)?);
    }
    Ok(Some(bets))
}

async fn store_batch(state: &LotteryState, bets: &[Bet]) -> Result<()> {
    state
        .store
        .append(bets)
        .await
        .map_err(ProtocolError::Storage)?;
    info!(count = bets.len(), "batch stored");
    Ok(())
}

/// Reads the reserved byte and the agency id that follow a last batch.
///
/// Agency ids start at 1, as in bet records; a zero id never reaches the
/// barrier.
async fn read_agency<R>(reader: &mut R) -> Result<Option<u32>>
where
    R: AsyncRead + Unpin,
{
    if read_u8(reader).await?.is_none() {
        return Ok(None);
    }
    match read_u8(reader).await? {
        None => Ok(None),
        Some(0) => Err(ProtocolError::InvalidAgency),
        Some(agency) => Ok(Some(agency.into())),
    }
}

async fn deliver_winners<W>(writer: &mut W, state: &LotteryState, agency: u32) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let winners = winners_for(&state.store, agency, state.winning_number)
        .await
        .map_err(ProtocolError::Storage)?;
    let payload = encode_winners(&winners)?;

    write_all(writer, &payload).await?;
    write_all(writer, ACK).await?;
    info!(agency, count = winners.len(), "winners delivered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::NaiveDate;
    use tempfile::TempDir;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
        time::timeout,
    };

    use super::*;
    use crate::{
        barrier::CompletionBarrier, bet::frame_record, store::BetStore,
        winners::DEFAULT_WINNING_NUMBER,
    };

    const LONG: Duration = Duration::from_secs(2);

    async fn state(expected: usize) -> (TempDir, Arc<LotteryState>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BetStore::open(dir.path().join("bets.csv")).await.expect("open");
        let state = LotteryState {
            store,
            barrier: CompletionBarrier::new(expected),
            winning_number: DEFAULT_WINNING_NUMBER,
        };
        (dir, Arc::new(state))
    }

    fn bet(agency: u32, document: &str, number: i64) -> Bet {
        Bet {
            agency,
            first_name: "Ana".into(),
            last_name: "Diaz".into(),
            document: document.into(),
            birthdate: NaiveDate::from_ymd_opt(1999, 5, 1).expect("valid date"),
            number,
        }
    }

    fn batch(last: bool, bets: &[Bet]) -> Vec<u8> {
        let mut message = BatchHeader {
            last,
            count: bets.len() as u8,
        }
        .to_bytes()
        .to_vec();
        for bet in bets {
            message.extend_from_slice(&frame_record(bet));
        }
        message
    }

    fn spawn_handler(
        state: &Arc<LotteryState>,
    ) -> (DuplexStream, tokio::task::JoinHandle<Result<()>>) {
        let (client, mut server) = tokio::io::duplex(1024);
        let state = Arc::clone(state);
        let task = tokio::spawn(async move { handle_connection(&mut server, &state).await });
        (client, task)
    }

    async fn stored(state: &LotteryState) -> Vec<Bet> {
        let mut bets = Vec::new();
        state.store.scan(|bet| bets.push(bet)).await.expect("scan");
        bets
    }

    async fn expect_ack(client: &mut DuplexStream) {
        let mut ack = [0u8; 4];
        timeout(LONG, client.read_exact(&mut ack))
            .await
            .expect("ack in time")
            .expect("read ack");
        assert_eq!(&ack, ACK);
    }

    #[tokio::test]
    async fn acknowledges_batches_until_the_last_one_then_sends_winners() {
        let (_dir, state) = state(1).await;
        let (mut client, task) = spawn_handler(&state);

        let first = [bet(1, "30111222", DEFAULT_WINNING_NUMBER), bet(1, "1", 1)];
        client.write_all(&batch(false, &first)).await.expect("send");
        expect_ack(&mut client).await;

        let second = [bet(1, "40222333", DEFAULT_WINNING_NUMBER)];
        client.write_all(&batch(true, &second)).await.expect("send");
        expect_ack(&mut client).await;

        client.write_all(&[0, 1]).await.expect("send agency");
        let mut reply = Vec::new();
        timeout(LONG, client.read_to_end(&mut reply))
            .await
            .expect("reply in time")
            .expect("read reply");

        let documents = b"30111222,40222333";
        assert_eq!(reply[0] as usize, documents.len());
        assert_eq!(&reply[1..1 + documents.len()], documents);
        assert_eq!(&reply[1 + documents.len()..], ACK);

        task.await.expect("handler task").expect("handler result");
        assert_eq!(stored(&state).await.len(), 3);
    }

    #[tokio::test]
    async fn empty_batches_are_acknowledged() {
        let (_dir, state) = state(1).await;
        let (mut client, task) = spawn_handler(&state);

        client.write_all(&batch(false, &[])).await.expect("send");
        expect_ack(&mut client).await;
        drop(client);

        task.await.expect("handler task").expect("handler result");
        assert!(stored(&state).await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_mid_record_discards_the_batch() {
        let (_dir, state) = state(1).await;
        let (mut client, task) = spawn_handler(&state);

        let mut message = batch(false, &[bet(1, "1", 1), bet(1, "2", 2)]);
        message.truncate(message.len() - 5);
        client.write_all(&message).await.expect("send");
        drop(client);

        task.await.expect("handler task").expect("short read is not an error");
        assert!(stored(&state).await.is_empty());
    }

    #[tokio::test]
    async fn malformed_record_aborts_the_connection_without_storing() {
        let (_dir, state) = state(1).await;
        let (mut client, task) = spawn_handler(&state);

        let mut message = batch(false, &[bet(1, "1", 1)]);
        let bad = b"1,Ana,Diaz,2,not-a-date,5";
        message[1] = 2;
        message.extend_from_slice(&(bad.len() as u32).to_be_bytes());
        message.extend_from_slice(bad);
        client.write_all(&message).await.expect("send");

        let result = timeout(LONG, task).await.expect("handler ends").expect("task");
        assert!(matches!(result, Err(ProtocolError::MalformedRecord(_))));
        assert!(stored(&state).await.is_empty());

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.expect("read");
        assert!(rest.is_empty(), "no ack for an aborted batch");
    }

    #[tokio::test]
    async fn oversized_record_length_is_rejected_before_reading_it() {
        let (_dir, state) = state(1).await;
        let (mut client, task) = spawn_handler(&state);

        let mut message = vec![0, 1];
        message.extend_from_slice(&u32::MAX.to_be_bytes());
        client.write_all(&message).await.expect("send");

        let result = timeout(LONG, task).await.expect("handler ends").expect("task");
        assert!(matches!(
            result,
            Err(ProtocolError::RecordTooLarge { max: MAX_RECORD_LEN, .. })
        ));
    }

    #[tokio::test]
    async fn closing_before_the_agency_trailer_is_orderly() {
        let (_dir, state) = state(2).await;
        let (mut client, task) = spawn_handler(&state);

        client.write_all(&batch(true, &[bet(1, "1", 1)])).await.expect("send");
        expect_ack(&mut client).await;
        client.write_all(&[0]).await.expect("reserved byte only");
        drop(client);

        task.await.expect("handler task").expect("handler result");
        assert_eq!(state.barrier.finished().await, 0);
        assert_eq!(stored(&state).await.len(), 1);
    }

    #[tokio::test]
    async fn zero_agency_trailer_is_rejected_without_counting() {
        let (_dir, state) = state(1).await;
        let (mut client, task) = spawn_handler(&state);

        client.write_all(&batch(true, &[bet(1, "1", 1)])).await.expect("send");
        expect_ack(&mut client).await;
        client.write_all(&[0, 0]).await.expect("send agency 0");

        let result = timeout(LONG, task).await.expect("handler ends").expect("task");
        assert!(matches!(result, Err(ProtocolError::InvalidAgency)));
        assert_eq!(state.barrier.finished().await, 0);
        assert!(!state.barrier.is_released());

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.expect("read");
        assert!(rest.is_empty(), "no winners for agency 0");
    }
}
