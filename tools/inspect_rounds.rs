use crashpoint::storage::{RocksStorage, Storage};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let db_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./DB/crash_data".to_string());
    let limit: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);

    println!("Opening database: {}", db_path);
    let storage = RocksStorage::open(&db_path)?;

    println!(
        "Users: {}  Rounds: {}",
        storage.count_users().await?,
        storage.count_rounds().await?
    );

    for round in storage.recent_rounds(limit).await? {
        let ended = round
            .end_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  crash {:>9}  bets {:>3}  wagered {:>8}  paid {:>8}  house {:>+12}  {}{}",
            round.round_id,
            round.crash_point.to_string(),
            round.bets.len(),
            round.total_wagered().to_string(),
            round.total_paid_out().to_string(),
            round.house_net(),
            ended,
            if round.admin_controlled { "  [admin]" } else { "" },
        );
    }

    println!("Top players:");
    for (rank, user) in storage.top_users(10).await?.iter().enumerate() {
        println!(
            "  {:>2}. {} ({})  winnings {}  played {}  won {}",
            rank + 1,
            user.username,
            user.user_id,
            user.total_winnings,
            user.games_played,
            user.games_won
        );
    }

    Ok(())
}
