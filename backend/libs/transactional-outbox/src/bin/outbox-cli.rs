use std::env;

use sqlx::PgPool;
use transactional_outbox::SqlxOutboxRepository;
use uuid::Uuid;

fn usage() -> ! {
    eprintln!("Usage:");
    eprintln!("  outbox-cli dead-letters <DATABASE_URL> [limit]");
    eprintln!("  outbox-cli requeue <event_uuid|all> <DATABASE_URL>");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage();
    }

    match args[1].as_str() {
        "dead-letters" if args.len() <= 4 => {
            let limit: i64 = args.get(3).map(|s| s.parse()).transpose()?.unwrap_or(100);
            let pool = PgPool::connect(&args[2]).await?;
            let repo = SqlxOutboxRepository::new(pool);
            let events = repo.dead_letters(limit).await?;
            for event in &events {
                println!(
                    "{}\t{}\t{}\tretries={}\t{}",
                    event.id,
                    event.aggregate_type,
                    event.aggregate_id,
                    event.retry_count,
                    event.last_error.as_deref().unwrap_or("-")
                );
            }
            println!("{} dead-lettered events", events.len());
        }
        "requeue" if args.len() == 4 => {
            let pool = PgPool::connect(&args[3]).await?;
            let repo = SqlxOutboxRepository::new(pool);
            let count = if args[2] == "all" {
                repo.requeue_all().await?
            } else {
                repo.requeue(Uuid::parse_str(&args[2])?).await?
            };
            println!("Requeued {} events", count);
        }
        _ => usage(),
    }

    Ok(())
}
