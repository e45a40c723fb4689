use clap::{Arg, ArgAction, Command};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use spdlog::sink::{StdStream, StdStreamSink};
use spdlog::{Level, LevelFilter, Logger};

use libring_evb::config::Config;
use libring_evb::correlator::CorrelatorParams;
use libring_evb::error::PipelineError;
use libring_evb::output::{EventCountObserver, RingWriterObserver};
use libring_evb::pipeline::Pipeline;
use libring_evb::tagger::FragmentTagger;

/// Stdout carries binary ring items, so all feedback goes to stderr
fn init_logging() {
    let sink = Arc::new(
        StdStreamSink::builder()
            .std_stream(StdStream::Stderr)
            .build()
            .expect("Could not create stderr log sink!"),
    );
    let logger = Arc::new(
        Logger::builder()
            .sink(sink)
            .level_filter(LevelFilter::MoreSevereEqual(Level::Info))
            .build()
            .expect("Could not create logger!"),
    );
    spdlog::set_default_logger(logger);
}

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).expect("Could not serialize default config!");
    let mut file = File::create(path).expect("Could not create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

/// Load the config file if given, otherwise start from defaults
fn load_config(matches: &clap::ArgMatches) -> Option<Config> {
    match matches.get_one::<String>("config") {
        Some(path) => {
            let path = PathBuf::from(path);
            spdlog::info!("Loading config from {}...", path.to_string_lossy());
            match Config::read_config_file(&path) {
                Ok(config) => Some(config),
                Err(e) => {
                    spdlog::error!("{e}");
                    None
                }
            }
        }
        None => Some(Config::default()),
    }
}

fn run_tag(config: &Config) -> Result<(), PipelineError> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut tagger = FragmentTagger::new(
        stdin.lock(),
        config.block_size,
        config.default_source_id,
        config.reset_timestamp_on_begin,
    )?;
    let mut sink = std::io::BufWriter::new(stdout.lock());
    let stats = tagger.tag_stream(&mut sink)?;
    spdlog::info!(
        "Tagged {} items ({})",
        stats.items,
        human_bytes::human_bytes(stats.bytes as f64)
    );
    Ok(())
}

fn run_build(config: &Config) -> Result<(), PipelineError> {
    let params = CorrelatorParams {
        coincidence_window: config.coincidence_window,
        timestamp_policy: config.timestamp_policy,
    };
    spdlog::info!(
        "Building with dt={} ticks, {:?} stamping",
        params.coincidence_window,
        params.timestamp_policy
    );

    let pipeline = Pipeline::start(params, &config.expected_sources);
    pipeline.add_observer(Box::new(RingWriterObserver::new(std::io::BufWriter::new(
        std::io::stdout(),
    ))));
    let counter = {
        let observer = EventCountObserver::new();
        let counter = observer.counter();
        pipeline.add_observer(Box::new(observer));
        counter
    };

    let stdin = std::io::stdin();
    let fed = pipeline.feed_fragments(stdin.lock())?;
    let stats = pipeline.finish()?;
    spdlog::info!(
        "Read {} fragments ({}); emitted {} items of which {} physics events",
        fed.fragments,
        human_bytes::human_bytes(fed.bytes as f64),
        stats.built_items,
        counter.load(Ordering::Relaxed)
    );
    Ok(())
}

fn main() {
    init_logging();

    let matches = Command::new("ring_evb_cli")
        .arg_required_else_help(true)
        .subcommand(
            Command::new("new")
                .about("Make a template configuration yaml file")
                .arg(
                    Arg::new("path")
                        .short('p')
                        .long("path")
                        .required(true)
                        .help("Path to the file"),
                ),
        )
        .subcommand(
            Command::new("tag")
                .about("Read ring items from stdin, write tagged fragments to stdout")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .help("Path to a configuration yaml file"),
                )
                .arg(
                    Arg::new("sid")
                        .long("sid")
                        .value_parser(clap::value_parser!(u32))
                        .help("Default source id for items without a body header"),
                )
                .arg(
                    Arg::new("reset-on-begin")
                        .long("reset-on-begin")
                        .action(ArgAction::SetTrue)
                        .help("Restart the timestamp epoch at each BEGIN_RUN"),
                ),
        )
        .subcommand(
            Command::new("build")
                .about("Read tagged fragments from stdin, write correlated ring items to stdout")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .help("Path to a configuration yaml file"),
                )
                .arg(
                    Arg::new("dt")
                        .long("dt")
                        .value_parser(clap::value_parser!(u64))
                        .help("Coincidence window in timestamp ticks"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("new", sub)) => {
            let path = PathBuf::from(sub.get_one::<String>("path").expect("path is required"));
            spdlog::info!("Making a template config at {}...", path.to_string_lossy());
            make_template_config(&path);
            spdlog::info!("Done.");
        }
        Some(("tag", sub)) => {
            let Some(mut config) = load_config(sub) else {
                std::process::exit(1);
            };
            if let Some(sid) = sub.get_one::<u32>("sid") {
                config.default_source_id = *sid;
            }
            if sub.get_flag("reset-on-begin") {
                config.reset_timestamp_on_begin = true;
            }
            if let Err(e) = run_tag(&config) {
                spdlog::error!("Tagging failed with error: {e}");
                std::process::exit(1);
            }
            spdlog::info!("Done.");
        }
        Some(("build", sub)) => {
            let Some(mut config) = load_config(sub) else {
                std::process::exit(1);
            };
            if let Some(dt) = sub.get_one::<u64>("dt") {
                config.coincidence_window = *dt;
            }
            if let Err(e) = run_build(&config) {
                spdlog::error!("Event building failed with error: {e}");
                std::process::exit(1);
            }
            spdlog::info!("Done.");
        }
        _ => (),
    }
}
