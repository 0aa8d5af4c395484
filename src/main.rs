use anyhow::anyhow;
use argh::FromArgs;
use buildcore::db::{Database, Record};
use buildcore::Key;
use tracing_subscriber::EnvFilter;

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(FromArgs)]
/// Inspect a buildcore build database.
struct Args {
    /// path to the build database
    #[argh(option, default = "String::from(\".buildcore_db\")")]
    db: String,

    /// log engine internals
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Dump(DumpArgs),
    Show(ShowArgs),
    Version(VersionArgs),
}

#[derive(FromArgs)]
/// list every record in the database
#[argh(subcommand, name = "dump")]
struct DumpArgs {}

#[derive(FromArgs)]
/// print the record of one key with its recorded inputs
#[argh(subcommand, name = "show")]
struct ShowArgs {
    /// the key to show
    #[argh(positional)]
    key: String,
}

#[derive(FromArgs)]
/// print the version
#[argh(subcommand, name = "version")]
struct VersionArgs {}

fn print_record(key: &Key, record: &Record, inputs: bool) {
    println!(
        "{} {} built:{} computed:{} bytes:{}",
        key,
        record.signature(),
        record.built_at,
        record.computed_at,
        record.value.data().len()
    );
    if inputs {
        for dep in &record.dependencies {
            println!("  {} {}", dep.key, dep.signature);
        }
    }
}

fn run() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if args.verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::new("warn"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Version(_) => {
            println!("{}", buildcore::version());
        }
        Command::Dump(_) => {
            let db = Database::open_read_only(&args.db)
                .map_err(|err| anyhow!("open {}: {}", args.db, err))?;
            println!("# epoch {}, {} records", db.epoch(), db.len());
            for (key, record) in db.records() {
                print_record(key, record, false);
            }
        }
        Command::Show(show) => {
            let db = Database::open_read_only(&args.db)
                .map_err(|err| anyhow!("open {}: {}", args.db, err))?;
            let key = Key::from(show.key);
            match db.get(&key) {
                Some(record) => print_record(&key, record, true),
                None => anyhow::bail!("no record for {}", key),
            }
        }
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        println!("buildcore: error: {:#}", err);
        std::process::exit(1);
    }
}
