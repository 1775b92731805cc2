use std::path::PathBuf;

use attention::AttentionControl;
use candle_core::Device;
use clap::Parser;
use editor::{build_hook, load_tokenizer, EditConfig, EditPlan, EditorError};

fn main() {
    if let Err(err) = run() {
        eprintln!("planning failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Prompt-to-prompt edit planner", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to edit config file")]
    config: PathBuf,

    #[arg(
        long,
        value_name = "PATH",
        help = "tokenizer.json to use instead of the configured one"
    )]
    tokenizer: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = 16,
        help = "Attention layers visited by one network pass"
    )]
    num_att_layers: usize,

    #[arg(long, help = "Print the plan as JSON")]
    json: bool,

    #[arg(short, long, help = "Enable debug logging")]
    verbose: bool,
}

fn run() -> Result<(), EditorError> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = EditConfig::from_path(&args.config)?;
    let tokenizer = load_tokenizer(&config, args.tokenizer.as_deref())?;
    let device = Device::Cpu;

    let mut hook = build_hook(&config, &tokenizer, &device)?;
    hook.set_num_att_layers(args.num_att_layers);

    let plan = EditPlan::new(&config, &tokenizer, &hook)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{}", plan);
    }
    Ok(())
}
