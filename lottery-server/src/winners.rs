//! Winner lookup over the bet store.

use std::io;

use crate::{bet::Bet, store::BetStore};

/// Winning number used when none is configured.
pub const DEFAULT_WINNING_NUMBER: i64 = 4540;

/// Returns the stored bets of `agency` that hold `winning_number`, in the
/// order they were stored.
///
/// Only meaningful once the completion barrier has opened; before that the
/// store may still be growing.
pub async fn winners_for(
    store: &BetStore,
    agency: u32,
    winning_number: i64,
) -> io::Result<Vec<Bet>> {
    let mut winners = Vec::new();
    store
        .scan(|bet| {
            if bet.agency == agency && bet.has_won(winning_number) {
                winners.push(bet);
            }
        })
        .await?;
    Ok(winners)
}
