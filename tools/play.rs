/// Play: terminal shell for running a story.
///
/// Usage: play [--config <path>] [--story <dir>] [--saves <dir>] [--seed <n>]
///
/// At the title screen pick a save slot or start a new game. During play,
/// enter an option number to choose it, or `q` to save and quit.

use narrative_runtime::core::driver::{RenderError, Renderer, Selection, SessionEnd};
use narrative_runtime::core::save::{list_slots, new_save_path, SaveFile};
use narrative_runtime::{Driver, GameConfig};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("game.ron");
    let mut story_dir = None;
    let mut save_dir = None;
    let mut seed = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_usage();
                return;
            }
            "--config" if i + 1 < args.len() => {
                i += 1;
                config_path = PathBuf::from(&args[i]);
            }
            "--story" if i + 1 < args.len() => {
                i += 1;
                story_dir = Some(PathBuf::from(&args[i]));
            }
            "--saves" if i + 1 < args.len() => {
                i += 1;
                save_dir = Some(PathBuf::from(&args[i]));
            }
            "--seed" if i + 1 < args.len() => {
                i += 1;
                match args[i].parse::<u64>() {
                    Ok(n) => seed = Some(n),
                    Err(_) => {
                        eprintln!("Invalid seed: {}", args[i]);
                        std::process::exit(1);
                    }
                }
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let mut config = match GameConfig::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    };
    if let Some(dir) = story_dir {
        config.story_dir = dir;
    }
    if let Some(dir) = save_dir {
        config.save_dir = dir;
    }
    if seed.is_some() {
        config.seed = seed;
    }

    if let Err(e) = init_logging(&config) {
        eprintln!("ERROR: could not open log file: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = play(&config) {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(config: &GameConfig) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }
    Ok(())
}

fn play(config: &GameConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut terminal = Terminal::new();

    let Some((save, save_path)) = title_screen(&mut terminal, config)? else {
        println!("Goodbye.");
        return Ok(());
    };

    let mut builder = Driver::builder()
        .story_dir(&config.story_dir)
        .save(save)
        .save_path(&save_path);
    if let Some(seed) = config.seed {
        builder = builder.seed(seed);
    }
    let mut driver = builder.build()?;

    match driver.run(&mut terminal)? {
        SessionEnd::Finished => println!("\nThe End."),
        SessionEnd::Quit => println!("\nGame saved to {}.", save_path.display()),
    }
    Ok(())
}

/// Pick a save slot or create a new player. `None` means quit.
fn title_screen(
    terminal: &mut Terminal,
    config: &GameConfig,
) -> Result<Option<(SaveFile, PathBuf)>, Box<dyn std::error::Error>> {
    let slots = list_slots(&config.save_dir)?;

    terminal.clear_screen()?;
    terminal.present_story("=== Narrative Runtime ===")?;

    let mut options: Vec<String> = slots
        .iter()
        .map(|slot| format!("Continue as {} ({})", slot.name, slot.fullname))
        .collect();
    options.push("New game".to_string());

    match terminal.present_options(&options)? {
        Selection::Quit => Ok(None),
        Selection::Index(index) if index < slots.len() => {
            let path = slots[index].path.clone();
            let save = SaveFile::load(&path)?;
            Ok(Some((save, path)))
        }
        Selection::Index(_) => new_player(terminal, config).map(Some),
    }
}

fn new_player(
    terminal: &mut Terminal,
    config: &GameConfig,
) -> Result<(SaveFile, PathBuf), Box<dyn std::error::Error>> {
    let name = terminal.prompt("What is your name, Viking? ")?;
    let fullname = terminal.prompt("And your full name? ")?;
    let fullname = if fullname.is_empty() { name.clone() } else { fullname };

    let save = SaveFile::new_player(name, fullname, config.new_game_stack()?);
    let path = new_save_path(&config.save_dir);
    save.write(&path)?;
    Ok((save, path))
}

/// Line-oriented stdin/stdout renderer.
struct Terminal {
    /// Lines printed since the last clear; clearing waits for Enter first.
    unread: bool,
}

impl Terminal {
    fn new() -> Self {
        Self { unread: false }
    }

    fn read_line(&self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    fn prompt(&mut self, question: &str) -> Result<String, RenderError> {
        loop {
            print!("{}", question);
            io::stdout().flush()?;
            match self.read_line()? {
                None => return Err(RenderError("input closed".to_string())),
                Some(answer) if !answer.is_empty() => return Ok(answer),
                Some(_) => {}
            }
        }
    }
}

impl Renderer for Terminal {
    fn present_story(&mut self, text: &str) -> Result<(), RenderError> {
        println!("{}\n", text);
        self.unread = true;
        Ok(())
    }

    fn present_dialogue(&mut self, speaker: &str, text: &str) -> Result<(), RenderError> {
        println!("{}: {}\n", speaker, text);
        self.unread = true;
        Ok(())
    }

    fn present_options(&mut self, options: &[String]) -> Result<Selection, RenderError> {
        for (i, option) in options.iter().enumerate() {
            println!("  {}. {}", i + 1, option);
        }
        loop {
            print!("> ");
            io::stdout().flush()?;
            let Some(line) = self.read_line()? else {
                return Ok(Selection::Quit);
            };
            if line.eq_ignore_ascii_case("q") {
                return Ok(Selection::Quit);
            }
            match line.parse::<usize>() {
                Ok(n) if (1..=options.len()).contains(&n) => {
                    self.unread = false;
                    return Ok(Selection::Index(n - 1));
                }
                _ => println!("Enter a number from 1 to {}, or q to quit.", options.len()),
            }
        }
    }

    fn clear_screen(&mut self) -> Result<(), RenderError> {
        if self.unread {
            print!("(press Enter)");
            io::stdout().flush()?;
            self.read_line()?;
        }
        print!("\x1B[2J\x1B[H");
        io::stdout().flush()?;
        self.unread = false;
        Ok(())
    }
}

fn print_usage() {
    println!("Usage: play [--config <path>] [--story <dir>] [--saves <dir>] [--seed <n>]");
    println!();
    println!("  --config <path>  RON game config (default: game.ron)");
    println!("  --story <dir>    story content directory (overrides config)");
    println!("  --saves <dir>    save directory (overrides config)");
    println!("  --seed <n>       fixed RNG seed (overrides config)");
}
