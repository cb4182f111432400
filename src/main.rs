mod config;
mod db;
mod engine;
mod error;
mod grade;
mod history;
mod logging;
mod models;
mod rating;
mod selection;

use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use config::EngineConfig;
use engine::Engine;
use error::EngineError;
use models::{AttemptRequest, JsonOutput, NewItem};

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Adaptive practice item selection with guess-corrected Elo ratings")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log engine decisions to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage learners
    #[command(subcommand)]
    Learner(LearnerCommands),

    /// Manage topics
    #[command(subcommand)]
    Topic(TopicCommands),

    /// Manage practice items
    #[command(subcommand)]
    Item(ItemCommands),

    /// Select the next item for a learner
    Next {
        /// Learner ID
        learner: String,

        /// Restrict selection to a topic
        #[arg(long, short)]
        topic: Option<i64>,

        /// Seed the band draw for a reproducible selection
        #[arg(long, short)]
        seed: Option<u64>,
    },

    /// Record the outcome of an attempt
    Attempt {
        /// Learner ID
        learner: String,

        /// Item ID
        item: i64,

        /// The answer was correct
        #[arg(long, conflicts_with = "incorrect", required_unless_present = "incorrect")]
        correct: bool,

        /// The answer was incorrect
        #[arg(long)]
        incorrect: bool,

        /// Response time in milliseconds
        #[arg(long, short)]
        response_ms: i64,

        /// Idempotency key; replays return the original outcome
        #[arg(long, short)]
        key: Option<String>,
    },

    /// Show a learner's ratings and grades
    Summary {
        /// Learner ID
        learner: String,
    },

    /// Map a rating to its grade, or list the grade table
    Grade {
        rating: Option<f64>,
    },

    /// Show store statistics
    Stats,
}

#[derive(Subcommand)]
enum LearnerCommands {
    /// Register a learner
    Add {
        /// Learner ID
        id: String,
    },

    /// Show learner details
    Show {
        /// Learner ID
        id: String,
    },

    /// Deactivate a learner (history is kept)
    Deactivate {
        /// Learner ID
        id: String,
    },
}

#[derive(Subcommand)]
enum TopicCommands {
    /// Add a new topic
    Add {
        /// Topic name
        name: String,
    },

    /// List all topics
    List,
}

#[derive(Subcommand)]
enum ItemCommands {
    /// Add a new item
    Add {
        /// Topic ID
        topic: i64,

        /// Initial rating (defaults to the configured default rating)
        #[arg(long, short)]
        rating: Option<f64>,

        /// Target grade label
        #[arg(long, short)]
        grade: Option<String>,

        /// Anchor item with a fixed calibrated rating
        #[arg(long)]
        anchor: bool,

        /// Expected answer text
        #[arg(long, short)]
        answer: Option<String>,

        /// Content metadata as a JSON object
        #[arg(long, short)]
        metadata: Option<String>,
    },

    /// Show item details and its rating history
    Show {
        /// Item ID
        id: i64,
    },

    /// List items
    List {
        /// Filter by topic ID
        #[arg(long, short)]
        topic: Option<i64>,
    },

    /// Deactivate an item
    Deactivate {
        /// Item ID
        id: i64,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(if cli.verbose { "debug" } else { "warn" });

    let json = cli.json;
    if let Err(e) = run(cli) {
        if json {
            if let Ok(out) = serde_json::to_string(&JsonOutput::<()>::err(e.to_string())) {
                println!("{}", out);
            }
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::load().map_err(EngineError::from)?;
    let db_path = config::db_path();
    let engine = Engine::open(&db_path, config)?;
    let db = engine.db();

    match cli.command {
        Commands::Init => {
            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::<()>::ok(()))?);
            } else {
                println!("Database initialized at: {}", db_path.display());
            }
        }

        Commands::Learner(learner_cmd) => match learner_cmd {
            LearnerCommands::Add { id } => {
                let learner = db.add_learner(&id)?;
                if cli.json {
                    println!("{}", serde_json::to_string(&JsonOutput::ok(&learner))?);
                } else {
                    println!("Added learner '{}'.", learner.id);
                }
            }

            LearnerCommands::Show { id } => {
                if let Some(learner) = db.get_learner(&id)? {
                    let summary = engine.rating_summary(&id)?;
                    let recent: Vec<i64> = engine
                        .history(&id)?
                        .entries(&id)
                        .map(|entry| entry.item_id)
                        .collect();
                    let attempts = db.list_attempts(&id)?;
                    if cli.json {
                        println!(
                            "{}",
                            serde_json::to_string(&JsonOutput::ok(serde_json::json!({
                                "learner": learner,
                                "summary": summary,
                                "recent_items": recent,
                                "attempts": attempts
                            })))?
                        );
                    } else {
                        println!("Learner: {}", learner.id);
                        println!("Active: {}", if learner.active { "yes" } else { "no" });
                        println!("Created: {}", learner.created_at);
                        println!(
                            "Rating: {:.1} ± {:.0} ({})",
                            summary.global_rating, summary.global_rd, summary.grade_label
                        );
                        println!("Attempts: {}", learner.attempt_count);
                        if let Some(last) = &learner.last_attempt_at {
                            println!("Last attempt: {}", last);
                        }
                        if !recent.is_empty() {
                            let ids: Vec<String> = recent.iter().map(|id| id.to_string()).collect();
                            println!("Recent items: {}", ids.join(", "));
                        }

                        if !attempts.is_empty() {
                            println!();
                            println!("--- Attempts ---");
                            for a in attempts.iter().rev().take(10) {
                                println!(
                                    "#{:<5} item {:<5} {:<9} {:.1} -> {:.1}  {}",
                                    a.id,
                                    a.item_id,
                                    if a.correct { "correct" } else { "incorrect" },
                                    a.learner.before,
                                    a.learner.after,
                                    a.attempted_at.format("%Y-%m-%d %H:%M")
                                );
                            }
                        }
                    }
                } else if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::<()>::err("Learner not found"))?
                    );
                } else {
                    println!("Learner not found.");
                }
            }

            LearnerCommands::Deactivate { id } => {
                if db.set_learner_active(&id, false)? {
                    if cli.json {
                        println!("{}", serde_json::to_string(&JsonOutput::<()>::ok(()))?);
                    } else {
                        println!("Learner '{}' deactivated.", id);
                    }
                } else if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::<()>::err("Learner not found"))?
                    );
                } else {
                    println!("Learner not found.");
                }
            }
        },

        Commands::Topic(topic_cmd) => match topic_cmd {
            TopicCommands::Add { name } => {
                let id = db.add_topic(&name)?;
                if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::ok(serde_json::json!({
                            "id": id,
                            "name": name
                        })))?
                    );
                } else {
                    println!("Added topic '{}' with ID: {}", name, id);
                }
            }

            TopicCommands::List => {
                let topics = db.list_topics()?;
                if cli.json {
                    println!("{}", serde_json::to_string(&JsonOutput::ok(&topics))?);
                } else if topics.is_empty() {
                    println!("No topics found.");
                } else {
                    println!("{:<5} NAME", "ID");
                    println!("{}", "-".repeat(40));
                    for topic in topics {
                        println!("{:<5} {}", topic.id, truncate(&topic.name, 34));
                    }
                }
            }
        },

        Commands::Item(item_cmd) => match item_cmd {
            ItemCommands::Add {
                topic,
                rating,
                grade,
                anchor,
                answer,
                metadata,
            } => {
                let metadata = metadata
                    .map(|m| serde_json::from_str::<serde_json::Value>(&m))
                    .transpose()
                    .map_err(|e| format!("Invalid metadata JSON: {}", e))?;

                let id = db.add_item(&NewItem {
                    topic_id: topic,
                    target_grade: grade,
                    rating,
                    anchor,
                    answer_text: answer,
                    metadata,
                })?;

                if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::ok(serde_json::json!({ "id": id })))?
                    );
                } else {
                    println!("Added item {} to topic {}.", id, topic);
                }
            }

            ItemCommands::Show { id } => {
                if let Some(item) = db.get_item(id)? {
                    let attempts = db.list_item_attempts(id)?;
                    if cli.json {
                        println!(
                            "{}",
                            serde_json::to_string(&JsonOutput::ok(serde_json::json!({
                                "item": item,
                                "attempts": attempts
                            })))?
                        );
                    } else {
                        let default_rating = engine.config().rating.default_rating;
                        println!("Item: {} (topic {})", item.id, item.topic_id);
                        println!(
                            "Rating: {:.1}{}",
                            item.rating.unwrap_or(default_rating),
                            if item.anchor { " (anchor)" } else { "" }
                        );
                        if let Some(grade) = &item.target_grade {
                            println!("Target grade: {}", grade);
                        }
                        if let Some(answer) = &item.answer_text {
                            println!("Answer: {}", answer);
                        }
                        println!("Active: {}", if item.active { "yes" } else { "no" });
                        println!("Attempts: {}", item.attempt_count);
                        if !attempts.is_empty() {
                            println!();
                            println!("--- Rating history ---");
                            for a in &attempts {
                                println!(
                                    "#{:<5} {:<12} {:<9} {:.1} -> {:.1}",
                                    a.id,
                                    truncate(&a.learner_id, 12),
                                    if a.correct { "correct" } else { "incorrect" },
                                    a.item.before,
                                    a.item.after
                                );
                            }
                        }
                    }
                } else if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::<()>::err("Item not found"))?
                    );
                } else {
                    println!("Item not found.");
                }
            }

            ItemCommands::List { topic } => {
                let items = db.list_items(topic)?;
                if cli.json {
                    println!("{}", serde_json::to_string(&JsonOutput::ok(&items))?);
                } else if items.is_empty() {
                    println!("No items found.");
                } else {
                    println!(
                        "{:<5} {:<6} {:<8} {:<9} {:<7} ANSWER",
                        "ID", "TOPIC", "RATING", "ATTEMPTS", "STATUS"
                    );
                    println!("{}", "-".repeat(70));
                    let default_rating = engine.config().rating.default_rating;
                    for item in items {
                        let status = match (item.active, item.anchor) {
                            (false, _) => "off",
                            (true, true) => "anchor",
                            (true, false) => "on",
                        };
                        println!(
                            "{:<5} {:<6} {:<8.1} {:<9} {:<7} {}",
                            item.id,
                            item.topic_id,
                            item.rating.unwrap_or(default_rating),
                            item.attempt_count,
                            status,
                            truncate(item.answer_text.as_deref().unwrap_or("-"), 30)
                        );
                    }
                }
            }

            ItemCommands::Deactivate { id } => {
                if db.set_item_active(id, false)? {
                    if cli.json {
                        println!("{}", serde_json::to_string(&JsonOutput::<()>::ok(()))?);
                    } else {
                        println!("Item {} deactivated.", id);
                    }
                } else if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::<()>::err("Item not found"))?
                    );
                } else {
                    println!("Item not found.");
                }
            }
        },

        Commands::Next {
            learner,
            topic,
            seed,
        } => {
            let mut rng = make_rng(seed);
            match engine.select_next(&learner, topic, &mut rng) {
                Ok(selection) => {
                    if cli.json {
                        println!("{}", serde_json::to_string(&JsonOutput::ok(&selection))?);
                    } else {
                        println!("=== Next Item ===");
                        println!();
                        println!("Item: {} (topic {})", selection.item_id, selection.topic_id);
                        println!(
                            "Band: {} around {:.1}",
                            selection.band.as_str(),
                            selection.reference_rating
                        );
                        if selection.recency_relaxed {
                            println!("(recently seen; no fresher item was available)");
                        }
                        println!();
                        println!("After answering, record the outcome with:");
                        println!(
                            "  etude attempt {} {} --correct|--incorrect --response-ms <ms>",
                            learner, selection.item_id
                        );
                    }
                }
                Err(EngineError::NoEligibleItems) if !cli.json => {
                    println!("No eligible items. Add some items first!");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Attempt {
            learner,
            item,
            correct,
            incorrect,
            response_ms,
            key,
        } => {
            let request = AttemptRequest {
                learner_id: learner,
                item_id: item,
                correct: correct && !incorrect,
                response_time_ms: response_ms,
                idempotency_key: key,
            };
            let outcome = engine.record_attempt(&request, Utc::now())?;

            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::ok(&outcome))?);
            } else {
                if outcome.replayed {
                    println!("Attempt {} already recorded.", outcome.attempt_id);
                } else {
                    println!("Attempt {} recorded.", outcome.attempt_id);
                }
                for (label, change) in [
                    ("Learner", outcome.learner),
                    ("Topic", outcome.topic),
                    ("Item", outcome.item),
                ] {
                    println!(
                        "{:<8} {:.1} -> {:.1} ({:+.1})",
                        label,
                        change.before,
                        change.after,
                        change.delta()
                    );
                }
            }
        }

        Commands::Summary { learner } => {
            let summary = engine.rating_summary(&learner)?;
            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::ok(&summary))?);
            } else {
                println!("=== Rating Summary: {} ===", summary.learner_id);
                println!(
                    "Overall: {:.1} ± {:.0} ({}), {} attempts",
                    summary.global_rating,
                    summary.global_rd,
                    summary.grade_label,
                    summary.attempt_count
                );
                if !summary.topics.is_empty() {
                    println!();
                    println!("{:<25} {:<8} {:<9} GRADE", "TOPIC", "RATING", "ATTEMPTS");
                    println!("{}", "-".repeat(55));
                    for topic in &summary.topics {
                        println!(
                            "{:<25} {:<8.1} {:<9} {}",
                            truncate(&topic.topic_name, 23),
                            topic.rating,
                            topic.attempt_count,
                            topic.grade_label
                        );
                    }
                }
            }
        }

        Commands::Grade { rating } => {
            let grades = engine.grades();
            match rating {
                Some(rating) => {
                    let label = grades.grade_for(rating);
                    if cli.json {
                        println!(
                            "{}",
                            serde_json::to_string(&JsonOutput::ok(serde_json::json!({
                                "rating": rating,
                                "grade": label
                            })))?
                        );
                    } else {
                        println!("{:.1} -> {}", rating, label);
                    }
                }
                None => {
                    if cli.json {
                        println!("{}", serde_json::to_string(&JsonOutput::ok(grades.bands()))?);
                    } else {
                        println!("{:<15} RANGE", "GRADE");
                        println!("{}", "-".repeat(35));
                        for band in grades.bands() {
                            println!("{:<15} {:.0} - {:.0}", band.label, band.min, band.max);
                        }
                    }
                }
            }
        }

        Commands::Stats => {
            let stats = db.get_stats()?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string(&JsonOutput::ok(serde_json::json!({
                        "learners": stats.learners,
                        "topics": stats.topics,
                        "active_items": stats.active_items,
                        "attempts": stats.attempts
                    })))?
                );
            } else {
                println!("=== Statistics ===");
                println!("Learners: {}", stats.learners);
                println!("Topics: {}", stats.topics);
                println!("Active items: {}", stats.active_items);
                println!("Attempts: {}", stats.attempts);
            }
        }
    }

    Ok(())
}

fn make_rng(seed: Option<u64>) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed.unwrap_or_else(rand::random))
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
