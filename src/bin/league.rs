use std::env;

use anyhow::bail;
use paddle_league::prelude::*;

const USAGE: &str = "usage: league [run | matches <agent> | head-to-head <agent> <agent> | rebuild-index]";

fn main() -> anyhow::Result<()> {
    let config = Configuration::from_env();
    let mut args = env::args().skip(1);

    match args.next().as_deref() {
        None | Some("run") => run(config),
        Some("matches") => {
            let Some(agent) = args.next() else { bail!(USAGE) };
            let index = MatchIndex::open(config.index_path());
            for entry in index.by_participant(&agent) {
                println!(
                    "{} {} {} vs {} {}-{} winner: {}",
                    entry.match_id,
                    entry.timestamp,
                    entry.p1,
                    entry.p2,
                    entry.final_score.0,
                    entry.final_score.1,
                    entry.winner_id().unwrap_or("draw")
                );
            }
            Ok(())
        }
        Some("head-to-head") => {
            let (Some(a), Some(b)) = (args.next(), args.next()) else {
                bail!(USAGE)
            };
            let h2h = MatchIndex::open(config.index_path()).head_to_head(&a, &b);
            println!(
                "{a} vs {b}: {} matches, {} - {} ({} draws)",
                h2h.total_matches, h2h.a_wins, h2h.b_wins, h2h.draws
            );
            Ok(())
        }
        Some("rebuild-index") => {
            let mut index = MatchIndex::open(config.index_path());
            let count = index.rebuild(&config.matches_dir())?;
            println!("{count} matches indexed");
            Ok(())
        }
        Some(other) => bail!("unknown command '{other}'\n{USAGE}"),
    }
}

fn run(config: Configuration) -> anyhow::Result<()> {
    let settings = LeagueSettings::load(config.settings_path())?.tournament;
    let verbose = config.verbose();
    let handle = TournamentHandle::spawn(TournamentScheduler::from_configuration(config, settings)?)?;
    let session = handle.join()?;

    if verbose {
        println!("{:?} after {} matches", session.outcome, session.matches_played);
        for (rank, standing) in session.rankings.iter().enumerate() {
            println!(
                "{:>2}. {:<30} {:>7.1}  {}",
                rank + 1,
                standing.agent_id,
                standing.rating,
                standing.record
            );
        }
        for deletion in &session.deletions {
            println!("deleted {}: {}", deletion.agent_id, deletion.reason);
        }
    }
    Ok(())
}
