use clap::{Parser, ValueEnum};
use influence_diagram::{init_logger, ConfigError, DiagramConfig, LinearModel, Objective};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ObjectiveKind {
    /// Expected path utility
    Ev,
    /// Conditional value-at-risk at `--alpha`
    Cvar,
    /// `weight * EV + (1 - weight) * CVaR`
    Combined,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Compile an influence diagram into an LP file", long_about = None)]
struct Args {
    /// Diagram description (JSON)
    diagram: PathBuf,

    #[arg(long, value_enum, default_value_t = ObjectiveKind::Ev)]
    objective: ObjectiveKind,

    /// Risk level of the CVaR objective
    #[arg(long, default_value_t = 0.05)]
    alpha: f64,

    /// Weight of the expected value in a combined objective
    #[arg(long, default_value_t = 0.5)]
    weight: f64,

    /// Overrides the scale factor of the diagram file
    #[arg(long)]
    scale_factor: Option<f64>,

    /// LP output file
    #[arg(short, long, default_value = "model.lp")]
    output: PathBuf,

    /// Also dump the model as JSON
    #[arg(long)]
    json: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    init_logger(args.verbose);
    if let Err(err) = formulate(&args) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

fn formulate(args: &Args) -> Result<(), ConfigError> {
    let mut config = DiagramConfig::from_path(&args.diagram)?;
    if let Some(scale_factor) = args.scale_factor {
        config.scale_factor = scale_factor;
    }
    let id = config.build()?;

    let objective = match args.objective {
        ObjectiveKind::Ev => Objective::ExpectedValue,
        ObjectiveKind::Cvar => Objective::ConditionalValueAtRisk { alpha: args.alpha },
        ObjectiveKind::Combined => Objective::Combined {
            alpha: args.alpha,
            weight: args.weight,
        },
    };

    let mut model = LinearModel::new();
    let formulation = id.formulate(&mut model, objective)?;

    let mut out = BufWriter::new(File::create(&args.output)?);
    model.write_lp(&mut out)?;
    out.flush()?;

    if let Some(path) = &args.json {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &model)?;
    }

    println!();
    println!("[{}]", args.diagram.display());
    println!("- Objective: {:?}", objective);
    println!("- Decision nodes: {}", formulation.decisions.blocks().len());
    println!("- Compatible paths: {}", formulation.paths.len());
    println!(
        "- Variables: {} ({} binary)",
        model.variables().len(),
        model.num_binaries()
    );
    println!("- Constraints: {}", model.constraints().len());
    println!("- Written to: {}", args.output.display());
    println!();
    Ok(())
}
