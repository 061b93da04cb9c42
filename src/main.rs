use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn, LevelFilter};

use leakscope::analysis::{self, AnalysisOptions, Analyzer};
use leakscope::core::types::TestcaseId;
use leakscope::preprocess;
use leakscope::symbols::SymbolResolver;
use leakscope::trace::{TraceFile, TracePrefix};

const DEFAULT_ANALYZERS: &[&str] = &[
    "instruction-memory-access-trace-leakage",
    "call-stack-memory-access-trace-leakage",
    "control-flow-leakage",
];

#[derive(Parser)]
#[command(
    name = "leakscope",
    version,
    about = "Side-channel leakage analyzer for binary execution traces"
)]
struct Opt {
    /// Log verbosity: debug, info, warning, error or result.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Write log output to a file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run leakage analyzers over a directory of binary traces.
    Analyze {
        /// Directory containing t<ID>.trace[.gz] files.
        #[arg(long)]
        trace_directory: PathBuf,

        /// Shared prefix trace. Defaults to prefix.trace[.gz] in the trace
        /// directory when present.
        #[arg(long)]
        prefix: Option<PathBuf>,

        #[arg(long)]
        output_directory: PathBuf,

        /// Result format: csv or txt.
        #[arg(long, default_value = "csv")]
        output_format: String,

        /// Additionally dump the analyzers' full per-testcase data.
        #[arg(long)]
        dump_full_data: bool,

        /// Analysis module to run; may be given several times.
        #[arg(long = "analyzer")]
        analyzers: Vec<String>,

        /// MAP file for symbol resolution; may be given several times.
        #[arg(long)]
        map_file: Vec<PathBuf>,

        /// Directory of *.map files for symbol resolution.
        #[arg(long)]
        map_directory: Option<PathBuf>,

        /// Image table sidecar. Defaults to images.txt in the trace
        /// directory when present.
        #[arg(long)]
        image_table: Option<PathBuf>,

        /// Worker threads feeding the parallel-safe analyzers.
        #[arg(long, default_value_t = 1)]
        max_parallel_threads: usize,

        /// Backpressure bound of the worker input queue.
        #[arg(long, default_value_t = 1)]
        input_buffer_size: usize,
    },

    /// Convert textual tracer output into binary traces.
    Preprocess {
        /// Directory with scripts.txt, optional prefix.txt and t<ID>.txt.
        #[arg(long)]
        input_directory: PathBuf,

        #[arg(long)]
        output_directory: PathBuf,

        /// gzip the emitted trace files.
        #[arg(long)]
        compress: bool,
    },

    /// Write human-readable listings of binary traces.
    Dump {
        #[arg(long)]
        trace_directory: PathBuf,

        #[arg(long)]
        prefix: Option<PathBuf>,

        #[arg(long)]
        output_directory: PathBuf,

        #[arg(long)]
        image_table: Option<PathBuf>,
    },
}

fn main() {
    let opt = Opt::parse();
    if let Err(e) = init_logger(&opt.log_level, opt.log_file.as_deref()) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    if let Err(e) = do_main(opt.command) {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logger(level: &str, file: Option<&Path>) -> Result<()> {
    let filter = match level {
        "debug" => LevelFilter::Debug,
        "info" | "result" => LevelFilter::Info,
        "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        other => bail!("unrecognized log level {:?}", other),
    };
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(filter);
    if let Some(path) = file {
        let target = fs::File::create(path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(target)));
    }
    builder.try_init().context("failed to initialize logger")?;
    Ok(())
}

struct RunConfig {
    trace_directory: PathBuf,
    prefix: Option<PathBuf>,
    analyzers: Vec<String>,
    options_output_directory: PathBuf,
    output_format: String,
    dump_full_data: bool,
    map_files: Vec<PathBuf>,
    map_directory: Option<PathBuf>,
    image_table: Option<PathBuf>,
    max_parallel_threads: usize,
    input_buffer_size: usize,
}

fn do_main(command: Command) -> Result<()> {
    match command {
        Command::Analyze {
            trace_directory,
            prefix,
            output_directory,
            output_format,
            dump_full_data,
            analyzers,
            map_file,
            map_directory,
            image_table,
            max_parallel_threads,
            input_buffer_size,
        } => run_analysis(RunConfig {
            trace_directory,
            prefix,
            analyzers: if analyzers.is_empty() {
                DEFAULT_ANALYZERS.iter().map(|s| s.to_string()).collect()
            } else {
                analyzers
            },
            options_output_directory: output_directory,
            output_format,
            dump_full_data,
            map_files: map_file,
            map_directory,
            image_table,
            max_parallel_threads,
            input_buffer_size,
        }),
        Command::Preprocess {
            input_directory,
            output_directory,
            compress,
        } => preprocess::preprocess_directory(&input_directory, &output_directory, compress),
        Command::Dump {
            trace_directory,
            prefix,
            output_directory,
            image_table,
        } => run_analysis(RunConfig {
            trace_directory,
            prefix,
            analyzers: vec!["dump".to_string()],
            options_output_directory: output_directory,
            output_format: "txt".to_string(),
            dump_full_data: false,
            map_files: Vec::new(),
            map_directory: None,
            image_table,
            max_parallel_threads: 1,
            input_buffer_size: 1,
        }),
    }
}

/// Finds `t<ID>.trace[.gz]` files and returns them sorted by testcase id.
fn collect_trace_files(dir: &Path) -> Result<Vec<(TestcaseId, PathBuf)>> {
    let mut files = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?
    {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        let stem = name
            .strip_suffix(".trace.gz")
            .or_else(|| name.strip_suffix(".trace"));
        if let Some(id) = stem
            .and_then(|s| s.strip_prefix('t'))
            .and_then(|s| s.parse::<TestcaseId>().ok())
        {
            files.push((id, path));
        }
    }
    files.sort();
    Ok(files)
}

fn build_resolver(config: &RunConfig) -> Result<SymbolResolver> {
    let mut resolver = SymbolResolver::new();
    let image_table = config
        .image_table
        .clone()
        .or_else(|| {
            let default = config.trace_directory.join("images.txt");
            default.is_file().then_some(default)
        });
    if let Some(path) = image_table {
        resolver.load_images(&path)?;
    } else {
        warn!("no image table found, instruction labels will be numeric");
    }
    for path in &config.map_files {
        resolver.load_map_file(path)?;
    }
    if let Some(dir) = &config.map_directory {
        resolver.load_map_directory(dir)?;
    }
    Ok(resolver)
}

fn run_analysis(config: RunConfig) -> Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            warn!("interrupt received, finishing the current testcase");
            cancel.store(true, Ordering::Relaxed);
        })
        .context("failed to install interrupt handler")?;
    }

    let resolver = Arc::new(build_resolver(&config)?);

    fs::create_dir_all(&config.options_output_directory).with_context(|| {
        format!(
            "failed to create output directory {}",
            config.options_output_directory.display()
        )
    })?;
    let mut options = AnalysisOptions::new(config.options_output_directory.clone());
    options.output_format = config.output_format.parse()?;
    options.dump_full_data = config.dump_full_data;
    options.cancel = cancel.clone();

    let analyzers: Vec<Arc<dyn Analyzer>> = config
        .analyzers
        .iter()
        .map(|name| analysis::create_analyzer(name, &options, &resolver).map(Arc::from))
        .collect::<Result<_>>()?;

    let prefix = {
        let path = config.prefix.clone().or_else(|| {
            ["prefix.trace", "prefix.trace.gz"]
                .iter()
                .map(|name| config.trace_directory.join(name))
                .find(|p| p.is_file())
        });
        match path {
            Some(path) => {
                let prefix = TracePrefix::from_file(&path)
                    .with_context(|| format!("failed to decode prefix {}", path.display()))?;
                info!(
                    "decoded shared prefix {} ({} entries)",
                    path.display(),
                    prefix.entries().len()
                );
                Arc::new(prefix)
            }
            None => TracePrefix::empty(),
        }
    };

    let files = collect_trace_files(&config.trace_directory)?;
    if files.is_empty() {
        bail!(
            "no t<ID>.trace files found in {}",
            config.trace_directory.display()
        );
    }

    let parallel: Vec<Arc<dyn Analyzer>> = analyzers
        .iter()
        .filter(|a| a.is_parallel_safe())
        .cloned()
        .collect();
    let sequential: Vec<Arc<dyn Analyzer>> = analyzers
        .iter()
        .filter(|a| !a.is_parallel_safe())
        .cloned()
        .collect();

    // Worker threads drain a bounded queue and feed the parallel-safe
    // analyzers; the sequential ones (the control-flow tree) ingest on this
    // thread, in ascending testcase order.
    let (sender, receiver) = mpsc::sync_channel::<(TestcaseId, Arc<TraceFile>)>(
        config.input_buffer_size.max(1),
    );
    let receiver = Arc::new(Mutex::new(receiver));
    let mut workers = Vec::new();
    if !parallel.is_empty() {
        for _ in 0..config.max_parallel_threads.max(1) {
            let receiver = receiver.clone();
            let analyzers = parallel.clone();
            workers.push(std::thread::spawn(move || loop {
                let received = receiver.lock().unwrap().recv();
                let (id, trace) = match received {
                    Ok(next) => next,
                    Err(_) => break,
                };
                for analyzer in &analyzers {
                    if let Err(e) = analyzer.add_trace(id, &trace) {
                        error!("{}: testcase {} dropped: {:#}", analyzer.name(), id, e);
                    }
                }
            }));
        }
    }

    let total = files.len();
    let mut processed = 0usize;
    for (id, path) in files {
        if cancel.load(Ordering::Relaxed) {
            warn!("cancelled after {} of {} testcase(s)", processed, total);
            break;
        }
        let trace = match TraceFile::open(&path, prefix.clone(), id) {
            Ok(trace) => Arc::new(trace),
            Err(e) => {
                error!("testcase {}: failed to open {}: {}", id, path.display(), e);
                continue;
            }
        };
        if !parallel.is_empty() && sender.send((id, trace.clone())).is_err() {
            break;
        }
        for analyzer in &sequential {
            if let Err(e) = analyzer.add_trace(id, &trace) {
                error!("{}: testcase {} dropped: {:#}", analyzer.name(), id, e);
            }
        }
        processed += 1;
    }
    drop(sender);
    for worker in workers {
        let _ = worker.join();
    }

    for analyzer in &analyzers {
        analyzer
            .finish()
            .with_context(|| format!("analyzer {} failed to finish", analyzer.name()))?;
    }
    info!("analysis complete: {} of {} testcase(s)", processed, total);
    Ok(())
}
