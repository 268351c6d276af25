use clap::Parser;
use influence_diagram::{
    init_logger, ConfigError, DecisionStrategy, DecisionVariables, DiagramConfig,
    InfluenceDiagram, LinearModel, Node, State, StateProbabilities, UtilityDistribution,
};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Analyze the decision strategy of a solved influence diagram", long_about = None)]
struct Args {
    /// Diagram description (JSON)
    diagram: PathBuf,

    /// Solver solution file with one `name value` pair per line
    #[arg(long, required_unless_present = "strategy", conflicts_with = "strategy")]
    solution: Option<PathBuf>,

    /// Strategy file written by an earlier `--save`
    #[arg(long)]
    strategy: Option<PathBuf>,

    /// Condition on `node=state`; repeat to condition on several states in order
    #[arg(long = "fix", value_parser = parse_fix)]
    fixes: Vec<(Node, State)>,

    /// Risk level of VaR and CVaR
    #[arg(long, default_value_t = 0.05)]
    alpha: f64,

    /// Save the decoded strategy to this file
    #[arg(long)]
    save: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_fix(s: &str) -> Result<(Node, State), String> {
    let (node, state) = s
        .split_once('=')
        .ok_or_else(|| format!("expected node=state, got '{}'", s))?;
    let node = node.trim().parse().map_err(|e| format!("bad node '{}': {}", node, e))?;
    let state = state.trim().parse().map_err(|e| format!("bad state '{}': {}", state, e))?;
    Ok((node, state))
}

fn main() {
    let args = Args::parse();
    init_logger(args.verbose);
    if let Err(err) = analyze(&args) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

fn load_strategy(args: &Args, id: &InfluenceDiagram) -> Result<DecisionStrategy, ConfigError> {
    match (&args.strategy, &args.solution) {
        (Some(path), _) => DecisionStrategy::load(path, &id.diagram),
        (None, Some(path)) => {
            let mut model = LinearModel::new();
            let decisions = DecisionVariables::new(&mut model, &id.diagram);
            let solution = model.read_solution(&fs::read_to_string(path)?);
            Ok(DecisionStrategy::decode(&decisions, &solution)?)
        }
        (None, None) => unreachable!("clap requires --solution or --strategy"),
    }
}

fn analyze(args: &Args) -> Result<(), ConfigError> {
    let id = DiagramConfig::from_path(&args.diagram)?.build()?;
    let strategy = load_strategy(args, &id)?;
    if let Some(path) = &args.save {
        strategy.save(path)?;
        log::info!("strategy saved to {}", path.display());
    }

    let forbidden = &id.options.forbidden;
    let mut probabilities =
        StateProbabilities::new(&id.diagram, &id.probabilities, forbidden, &strategy)?;
    for &(node, state) in &args.fixes {
        probabilities = probabilities.condition(
            &id.diagram,
            &id.probabilities,
            forbidden,
            &strategy,
            node,
            state,
        )?;
    }
    let distribution = UtilityDistribution::conditional(
        &id.diagram,
        &id.probabilities,
        forbidden,
        &strategy,
        &id.consequences,
        probabilities.fixed(),
    )?;
    let labels = &id.labels;

    println!();
    println!("[Decision strategy]");
    for rule in strategy.rules() {
        println!("- {}", labels.node(rule.node()));
        for (context, choice) in rule.iter() {
            let context = rule
                .context()
                .iter()
                .zip(&context)
                .map(|(&n, &s)| format!("{}={}", labels.node(n), labels.state(n, s)))
                .collect::<Vec<_>>();
            println!(
                "    {}: {}",
                if context.is_empty() {
                    "-".to_string()
                } else {
                    context.join(", ")
                },
                labels.state(rule.node(), choice)
            );
        }
    }

    println!();
    println!("[State probabilities]");
    if !probabilities.fixed().is_empty() {
        println!("- Condition probability: {:.6}", probabilities.mass());
    }
    for (node, states) in probabilities.iter() {
        let fixed = probabilities.fixed().get(&node);
        println!(
            "- {}{}",
            labels.node(node),
            if fixed.is_some() { " (fixed)" } else { "" }
        );
        for (state, p) in states.iter().enumerate() {
            println!("    {}: {:.2}%", labels.state(node, state), 100.0 * p);
        }
    }

    println!();
    println!("[Utility distribution]");
    for (u, p) in distribution.iter() {
        println!("    {:+.4}: {:.4}", u, p);
    }

    let stats = distribution.statistics();
    let risk = distribution.risk_measures(args.alpha)?;
    let optional = |x: Option<f64>| x.map_or_else(|| "-".to_string(), |x| format!("{:+.4}", x));
    println!();
    println!("[Statistics]");
    println!("- Mean: {:+.4}", stats.mean);
    println!("- Std: {:.4}", stats.std);
    println!("- Skewness: {}", optional(stats.skewness));
    println!("- Kurtosis (excess): {}", optional(stats.kurtosis));
    println!("- VaR({}): {:+.4}", risk.alpha, risk.value_at_risk);
    println!("- CVaR({}): {:+.4}", risk.alpha, risk.conditional_value_at_risk);
    println!();
    Ok(())
}
