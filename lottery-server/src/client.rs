//! Reference agency client.
//!
//! Speaks the server's batch protocol: it submits bets in batches, flags the
//! last one, then asks for its agency's winners. The `submit` subcommand
//! wraps it around a CSV file of bets.

use std::{net::SocketAddr, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tracing::{info, warn};

use crate::{
    bet::{decode_winners, frame_record, BatchHeader, Bet, ACK},
    cli::SubmitArgs,
    framing::{read_exact, read_u8, write_all},
};

pub struct AgencyClient<S> {
    stream: S,
}

impl AgencyClient<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        Ok(Self::new(stream))
    }
}

impl<S> AgencyClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Sends one batch and waits for the server to acknowledge it.
    pub async fn send_batch(&mut self, bets: &[Bet], last: bool) -> Result<()> {
        let count = u8::try_from(bets.len())
            .map_err(|_| anyhow!("a batch holds at most 255 bets, got {}", bets.len()))?;

        let mut message = BatchHeader { last, count }.to_bytes().to_vec();
        for bet in bets {
            message.extend_from_slice(&frame_record(bet));
        }
        write_all(&mut self.stream, &message).await?;
        self.expect_ack().await
    }

    /// Names the agency after its last batch and waits for its winners.
    ///
    /// Returns the winning documents once every expected agency is done.
    pub async fn request_winners(&mut self, agency: u8) -> Result<Vec<String>> {
        write_all(&mut self.stream, &[0, agency]).await?;

        let len = read_u8(&mut self.stream)
            .await?
            .context("server closed before sending winners")?;
        let payload = read_exact(&mut self.stream, len.into())
            .await?
            .context("server closed mid winners payload")?;
        let documents = decode_winners(&payload)?;
        self.expect_ack().await?;
        Ok(documents)
    }

    pub async fn close(mut self) {
        if let Err(err) = self.stream.shutdown().await {
            warn!(error = ?err, "failed to shut down client connection cleanly");
        }
    }

    async fn expect_ack(&mut self) -> Result<()> {
        let ack = read_exact(&mut self.stream, ACK.len())
            .await?
            .context("server closed before acknowledging")?;
        if ack != ACK {
            bail!("unexpected acknowledgment {:?}", String::from_utf8_lossy(&ack));
        }
        Ok(())
    }
}

/// Submits every bet in `args.bets` for `args.agency` and prints the winners.
pub async fn run(args: SubmitArgs) -> Result<()> {
    let bets = load_agency_bets(&args.bets, args.agency).await?;
    let mut client = AgencyClient::connect(args.server).await?;
    info!(server = %args.server, agency = args.agency, bets = bets.len(), "submitting bets");

    let winners = submit_all(&mut client, &bets, args.agency, args.batch_max_amount).await?;
    client.close().await;

    println!("winners: {}", winners.len());
    for document in winners {
        println!("{document}");
    }
    Ok(())
}

/// Byte budget of one batch message, header and length prefixes included.
pub const BATCH_MAX_BYTES: usize = 8 * 1024;

/// Sends `bets` in batches, flagging the last one, and then collects the
/// agency's winners.
pub async fn submit_all<S>(
    client: &mut AgencyClient<S>,
    bets: &[Bet],
    agency: u8,
    batch_max_amount: u8,
) -> Result<Vec<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let batches = plan_batches(bets, batch_max_amount.max(1).into(), BATCH_MAX_BYTES)?;
    if batches.is_empty() {
        client.send_batch(&[], true).await?;
    }
    for (index, batch) in batches.iter().enumerate() {
        client.send_batch(batch, index + 1 == batches.len()).await?;
    }
    client.request_winners(agency).await
}

/// Cuts `bets` into consecutive batches of at most `max_amount` bets whose
/// messages fit in `max_bytes`.
///
/// A batch over the byte budget shrinks to three quarters of its size until
/// it fits; a single bet that does not fit on its own is an error.
pub fn plan_batches(bets: &[Bet], max_amount: usize, max_bytes: usize) -> Result<Vec<&[Bet]>> {
    let mut batches = Vec::new();
    let mut rest = bets;
    while !rest.is_empty() {
        let mut size = max_amount.min(rest.len());
        while batch_message_len(&rest[..size]) > max_bytes {
            size = size * 3 / 4;
            if size < 1 {
                bail!("bet {} does not fit in a {max_bytes} byte batch", rest[0].document);
            }
        }
        let (batch, tail) = rest.split_at(size);
        batches.push(batch);
        rest = tail;
    }
    Ok(batches)
}

fn batch_message_len(bets: &[Bet]) -> usize {
    let header = BatchHeader { last: false, count: 0 }.to_bytes().len();
    header + bets.iter().map(|bet| frame_record(bet).len()).sum::<usize>()
}

/// Reads `first_name,last_name,document,birthdate,number` rows and stamps
/// each one with `agency`.
pub async fn load_agency_bets(path: &Path, agency: u8) -> Result<Vec<Bet>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut bets = Vec::new();
    let mut line_number = 0;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let bet = format!("{agency},{line}")
            .parse::<Bet>()
            .with_context(|| format!("{}:{line_number}: invalid bet", path.display()))?;
        bets.push(bet);
    }
    Ok(bets)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn loads_rows_and_stamps_the_agency() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "Ana,Diaz,30111222,1999-05-01,4540").expect("write");
        writeln!(file).expect("write");
        writeln!(file, "Juan,Perez,20333444,1980-01-31,17\r").expect("write");

        let bets = load_agency_bets(file.path(), 3).await.expect("load");
        assert_eq!(bets.len(), 2);
        assert!(bets.iter().all(|bet| bet.agency == 3));
        assert_eq!(bets[1].document, "20333444");
    }

    #[tokio::test]
    async fn reports_the_offending_line() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "Ana,Diaz,30111222,1999-05-01,4540").expect("write");
        writeln!(file, "Ana,Diaz,30111222,tomorrow,4540").expect("write");

        let err = load_agency_bets(file.path(), 1).await.expect_err("bad row");
        assert!(format!("{err:#}").contains(":2: invalid bet"));
    }

    fn long_named_bet(document: usize) -> Bet {
        let mut bet = format!("1,Ana,Diaz,{document},1999-05-01,4540")
            .parse::<Bet>()
            .expect("valid bet");
        bet.first_name = "A".repeat(1000);
        bet.last_name = "B".repeat(1000);
        bet
    }

    #[test]
    fn oversized_batches_shrink_until_they_fit_the_byte_budget() {
        let bets: Vec<Bet> = (0..10).map(long_named_bet).collect();

        let batches = plan_batches(&bets, 100, BATCH_MAX_BYTES).expect("plan");
        let sizes: Vec<usize> = batches.iter().map(|batch| batch.len()).collect();
        assert_eq!(sizes, vec![3, 3, 4]);
        assert!(batches
            .iter()
            .all(|batch| batch_message_len(batch) <= BATCH_MAX_BYTES));
        assert_eq!(batches.concat(), bets);
    }

    #[test]
    fn small_bets_are_limited_by_count_only() {
        let bets: Vec<Bet> = (0..10)
            .map(|i| format!("1,Ana,Diaz,{i},1999-05-01,4540").parse().expect("valid bet"))
            .collect();
        let sizes: Vec<usize> = plan_batches(&bets, 4, BATCH_MAX_BYTES)
            .expect("plan")
            .iter()
            .map(|batch| batch.len())
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(plan_batches(&[], 4, BATCH_MAX_BYTES).expect("plan").is_empty());
    }

    #[test]
    fn a_bet_larger_than_the_budget_is_refused() {
        let bets = [long_named_bet(7)];
        let err = plan_batches(&bets, 100, 1024).expect_err("too large");
        assert!(err.to_string().contains("does not fit"));
    }
}
