use std::error::Error;
use std::io::{self, BufRead, Write};
#[cfg(feature = "web")]
use std::net::SocketAddr;
use std::path::PathBuf;

use atty::Stream;
use clap::{Args, Parser, Subcommand};
use connections_rs::{
    DEFAULT_DATABASE, DatabaseSource, GameSession, GenerationOptions, Group, LoadedDatabase,
    MAX_ATTEMPTS, Phase, Preset, Puzzle, Renderer, Severity, SubmitOutcome, Toggle,
    display_math, generate_puzzle, render::mistake_visual,
};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rayon::prelude::*;
use serde_json::json;
use termimad::{FmtText, MadSkin, terminal_size};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "connections-rs",
    about = "Generate and play Connections puzzles built from math expressions",
    version
)]
pub struct Cli {
    /// Emit JSON instead of human-readable tables.
    #[arg(long, global = true)]
    json: bool,

    /// Read `<id>.json` databases from this directory instead of the bundled copies.
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Expression database to load.
    #[arg(long, global = true, default_value = DEFAULT_DATABASE)]
    database: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List categories with the number of expressions tagged with each.
    Categories,
    /// Generate a single puzzle.
    Generate {
        /// Seed for a reproducible puzzle.
        #[arg(long)]
        seed: Option<u64>,
        #[command(flatten)]
        generation: GenerationArgs,
    },
    /// Play a puzzle in the terminal.
    Play {
        #[arg(long)]
        seed: Option<u64>,
        #[command(flatten)]
        generation: GenerationArgs,
    },
    /// Generate many seeded puzzles and report how often generation falls back.
    Survey {
        /// Number of puzzles to generate.
        #[arg(short, long, default_value_t = 500)]
        count: u64,
        /// First seed; puzzles use consecutive seeds from here.
        #[arg(long, default_value_t = 0)]
        start_seed: u64,
        #[command(flatten)]
        generation: GenerationArgs,
    },
    /// Serve the JSON game API.
    #[cfg(feature = "web")]
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
    },
}

#[derive(Args, Debug, Clone)]
struct GenerationArgs {
    /// Start from a named option bundle.
    #[arg(long, value_enum, default_value_t = Preset::Standard)]
    preset: Preset,
    #[arg(long)]
    min_difficulty: Option<u8>,
    #[arg(long)]
    max_difficulty: Option<u8>,
    /// Preferred category; repeat for more. Ignored unless four are available.
    #[arg(long = "prefer", value_name = "CATEGORY")]
    prefer: Vec<String>,
    /// Category to exclude; repeat for more.
    #[arg(long = "avoid", value_name = "CATEGORY")]
    avoid: Vec<String>,
    /// Reject categories fully covered by ones already chosen.
    #[arg(long)]
    strict_overlap: bool,
    /// Attempt budget, capped at the built-in maximum.
    #[arg(long)]
    max_attempts: Option<usize>,
}

impl GenerationArgs {
    fn options(&self) -> Result<GenerationOptions, Box<dyn Error>> {
        let mut options = self.preset.options();
        if let Some(min) = self.min_difficulty {
            options.min_difficulty = min;
        }
        if let Some(max) = self.max_difficulty {
            options.max_difficulty = max;
        }
        if options.min_difficulty > options.max_difficulty {
            return Err(format!(
                "min difficulty {} exceeds max difficulty {}",
                options.min_difficulty, options.max_difficulty
            )
            .into());
        }
        if !self.prefer.is_empty() {
            options.preferred_groups = self.prefer.clone();
        }
        options.avoid_groups.extend(self.avoid.iter().cloned());
        options.strict_overlap |= self.strict_overlap;
        if let Some(max_attempts) = self.max_attempts {
            options.max_attempts = max_attempts.clamp(1, MAX_ATTEMPTS);
        }
        Ok(options)
    }
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let source = match &cli.data_dir {
        Some(dir) => DatabaseSource::Directory(dir.clone()),
        None => DatabaseSource::Bundled,
    };
    match cli.command {
        Command::Categories => {
            init_tracing("warn")?;
            handle_categories(&source, &cli.database, cli.json)
        }
        Command::Generate { seed, generation } => {
            init_tracing("warn")?;
            handle_generate(&source, &cli.database, seed, &generation, cli.json)
        }
        Command::Play { seed, generation } => {
            init_tracing("warn")?;
            handle_play(&source, &cli.database, seed, &generation)
        }
        Command::Survey {
            count,
            start_seed,
            generation,
        } => {
            init_tracing("warn")?;
            handle_survey(&source, &cli.database, count, start_seed, &generation, cli.json)
        }
        #[cfg(feature = "web")]
        Command::Serve { addr } => {
            init_tracing("info")?;
            handle_serve(addr, cli.data_dir)
        }
    }
}

/// Logs go to stderr; `RUST_LOG` overrides `default_level`.
fn init_tracing(default_level: &str) -> Result<(), Box<dyn Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .try_init()?;
    Ok(())
}

fn load(source: &DatabaseSource, id: &str) -> LoadedDatabase {
    let loaded = source.load_or_fallback(id);
    if loaded.fell_back {
        eprintln!("warning: could not load database {id:?}, using the built-in fallback set");
    }
    loaded
}

fn rng_for(seed: Option<u64>) -> SmallRng {
    match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    }
}

fn handle_categories(
    source: &DatabaseSource,
    id: &str,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    let loaded = load(source, id);
    let rows = loaded.database.category_supports();

    if as_json {
        let payload = json!({
            "database": loaded.id,
            "fallback": loaded.fell_back,
            "expressions": loaded.database.len(),
            "categories": rows.iter().map(|(name, count)| {
                json!({ "category": name, "expressions": count })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_category_table(&loaded.id, &rows);
    }
    Ok(())
}

fn handle_generate(
    source: &DatabaseSource,
    id: &str,
    seed: Option<u64>,
    generation: &GenerationArgs,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    let options = generation.options()?;
    let loaded = load(source, id);
    let mut rng = rng_for(seed);
    let generated = generate_puzzle(&loaded.database, &options, &mut rng);

    if as_json {
        let payload = json!({
            "database": loaded.id,
            "seed": seed,
            "attempts": generated.attempts,
            "fallback": generated.fell_back,
            "puzzle": generated.puzzle,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        if generated.fell_back {
            println!(
                "No unique puzzle after {} attempts; showing the fallback puzzle.",
                generated.attempts
            );
        } else {
            println!(
                "Generated from {} in {} attempt(s).",
                loaded.id, generated.attempts
            );
        }
        render_markdown_block(&puzzle_markdown(&generated.puzzle));
    }
    Ok(())
}

fn handle_survey(
    source: &DatabaseSource,
    id: &str,
    count: u64,
    start_seed: u64,
    generation: &GenerationArgs,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    if count == 0 {
        return Err("Survey count must be at least 1".into());
    }
    let options = generation.options()?;
    let loaded = load(source, id);
    let database = &loaded.database;

    let runs: Vec<(usize, bool)> = (start_seed..start_seed.saturating_add(count))
        .into_par_iter()
        .map(|seed| {
            let mut rng = SmallRng::seed_from_u64(seed);
            let generated = generate_puzzle(database, &options, &mut rng);
            (generated.attempts, generated.fell_back)
        })
        .collect();

    let total = runs.len();
    let fallbacks = runs.iter().filter(|(_, fell_back)| *fell_back).count();
    let successes: Vec<usize> = runs
        .iter()
        .filter(|(_, fell_back)| !fell_back)
        .map(|(attempts, _)| *attempts)
        .collect();
    let mean_attempts = if successes.is_empty() {
        0.0
    } else {
        successes.iter().sum::<usize>() as f64 / successes.len() as f64
    };
    let max_attempts = successes.iter().copied().max().unwrap_or(0);
    let fallback_rate = fallbacks as f64 / total as f64;

    if as_json {
        let payload = json!({
            "database": loaded.id,
            "options": options,
            "puzzles": total,
            "fallbacks": fallbacks,
            "fallbackRate": fallback_rate,
            "meanAttempts": mean_attempts,
            "maxAttempts": max_attempts,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!(
            "Database {} (difficulty {}-{})",
            loaded.id, options.min_difficulty, options.max_difficulty
        );
        println!("{:<16}  {}", "PUZZLES", total);
        println!(
            "{:<16}  {} ({:.1}%)",
            "FALLBACKS",
            fallbacks,
            fallback_rate * 100.0
        );
        println!("{:<16}  {:.2}", "MEAN ATTEMPTS", mean_attempts);
        println!("{:<16}  {}", "MAX ATTEMPTS", max_attempts);
    }
    Ok(())
}

#[cfg(feature = "web")]
fn handle_serve(addr: SocketAddr, data_dir: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let config = connections_rs::web::WebConfig { addr, data_dir };
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(connections_rs::web::serve(config))?;
    Ok(())
}

fn handle_play(
    source: &DatabaseSource,
    id: &str,
    seed: Option<u64>,
    generation: &GenerationArgs,
) -> Result<(), Box<dyn Error>> {
    let options = generation.options()?;
    let mut renderer = TerminalRenderer;
    let mut session = GameSession::new(rng_for(seed));
    session.switch_database(source, id, &options, &mut renderer)?;
    print_help();

    let stdin = io::stdin();
    loop {
        print_selection(&session);
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        match input {
            "" => continue,
            "q" | "quit" => break,
            "h" | "help" => print_help(),
            "d" | "deselect" => {
                if let Err(err) = session.deselect_all() {
                    println!("{err}");
                }
            }
            "r" | "shuffle" => session.shuffle(&mut renderer)?,
            "n" | "new" => {
                session.new_game(&options, &mut renderer)?;
            }
            "s" | "submit" => match session.submit(&mut renderer) {
                Ok(SubmitOutcome::Correct { won: true, .. }) | Ok(SubmitOutcome::Lost { .. }) => {
                    println!("Type `n` for a new puzzle or `q` to quit.");
                }
                Ok(_) => {}
                Err(err) => println!("{err}"),
            },
            other => toggle_positions(&mut session, other),
        }
    }
    Ok(())
}

fn toggle_positions(session: &mut GameSession, input: &str) {
    if session.phase() != Phase::Playing {
        println!("The game is over. Type `n` for a new puzzle.");
        return;
    }
    for token in input.split(|c: char| c.is_whitespace() || c == ',') {
        if token.is_empty() {
            continue;
        }
        let Some(text) = token
            .parse::<usize>()
            .ok()
            .and_then(|position| position.checked_sub(1))
            .and_then(|index| session.grid().get(index).cloned())
        else {
            println!("Unknown command or card {token:?}. Type `h` for help.");
            continue;
        };
        match session.toggle(&text) {
            Ok(Toggle::Ignored) => println!("Four cards are already selected."),
            Ok(_) => {}
            Err(err) => println!("{err}"),
        }
    }
}

fn print_help() {
    println!("Enter card numbers to select or deselect them (e.g. `1 5 9`).");
    println!("  s  submit    d  deselect all    r  shuffle");
    println!("  n  new game  h  help            q  quit");
}

fn print_selection(session: &GameSession) {
    if session.phase() != Phase::Playing {
        return;
    }
    let positions: Vec<String> = session
        .selected()
        .iter()
        .filter_map(|text| session.grid().iter().position(|card| card == text))
        .map(|index| (index + 1).to_string())
        .collect();
    println!(
        "Selected [{}]  mistakes {}",
        positions.join(" "),
        mistake_visual(session.mistakes_remaining())
    );
}

/// Prints every render call straight to the terminal.
struct TerminalRenderer;

impl Renderer for TerminalRenderer {
    fn render_grid(&mut self, expressions: &[String]) {
        if expressions.is_empty() {
            return;
        }
        println!();
        let width = expressions.len().to_string().len();
        for (index, text) in expressions.iter().enumerate() {
            println!("{:>width$}. {}", index + 1, text, width = width);
        }
    }

    fn render_found_group(&mut self, group: &Group) {
        render_markdown_block(&group_markdown(group));
    }

    fn render_message(&mut self, text: &str, severity: Severity) {
        let marker = match severity {
            Severity::Success => "✓",
            Severity::Warning => "!",
            Severity::Error => "✕",
            Severity::Info => "·",
        };
        println!("{marker} {text}");
    }

    fn render_mistake_counter(&mut self, remaining: u8) {
        println!("Mistakes remaining: {}", mistake_visual(remaining));
    }

    fn render_loading(&mut self, loading: bool) {
        if loading {
            println!("Loading database…");
        }
    }
}

fn print_category_table(database: &str, rows: &[(String, usize)]) {
    if rows.is_empty() {
        println!("Database {database} has no categories.");
        return;
    }
    let width = rows
        .iter()
        .map(|(name, _)| name.len())
        .max()
        .unwrap_or(8)
        .max("CATEGORY".len());
    println!("Categories in {database}:");
    println!("{:<width$}  {}", "CATEGORY", "EXPRESSIONS", width = width);
    println!("{:-<width$}  {}", "", "-----------", width = width);
    for (name, count) in rows {
        println!("{:<width$}  {}", name, count, width = width);
    }
}

fn group_markdown(group: &Group) -> String {
    let mut text = format!("**{}** ({})\n", group.category, group.label);
    for expression in &group.expressions {
        text.push_str(&format!("- {}\n", display_math(expression)));
    }
    text
}

fn puzzle_markdown(puzzle: &Puzzle) -> String {
    puzzle
        .groups
        .iter()
        .map(group_markdown)
        .collect::<Vec<_>>()
        .join("\n")
}

fn stdout_is_tty() -> bool {
    atty::is(Stream::Stdout)
}

fn markdown_width() -> usize {
    let (width, _) = terminal_size();
    width.max(60) as usize
}

fn render_markdown_block(body: &str) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return;
    }
    println!();
    if stdout_is_tty() {
        let skin = MadSkin::default();
        let formatted = FmtText::from(&skin, trimmed, Some(markdown_width()));
        println!("{formatted}");
    } else {
        println!("{trimmed}");
    }
}
