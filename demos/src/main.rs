use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use parasweep::{
    Bindings, Inputs, ReduceContext, Reduction, Registry, Strategy, SweepDescription, SweepManager,
    Tag, Task, Value,
};
use serde::Deserialize;

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Engine {
    Eager,
    Delayed,
    Inline,
    Pool,
}

#[derive(Parser, Debug, Clone)]
struct Args {
    #[clap(value_enum, index = 1, default_value = "delayed")]
    engine: Engine,
    /// Worker threads of the pool engine.
    #[clap(long, default_value_t = 4)]
    workers: usize,
    /// Persist results and the sweep description here.
    #[clap(long)]
    out: Option<Utf8PathBuf>,
    /// Rebuild the sweep from a saved description instead.
    #[clap(long)]
    from: Option<Utf8PathBuf>,
    #[clap(long, default_value = "info")]
    log: String,
}

#[derive(Deserialize)]
struct MeshOptions {
    width: f64,
    cells: usize,
}

/// Uniform 1D mesh over `[0, width]`.
#[derive(Default)]
struct Mesh;

impl Reduction for Mesh {
    const CLASS: &'static str = "mesh";
    type Output = Vec<f64>;

    fn reduce(&self, _: &ReduceContext, options: &Value, _: &Inputs) -> anyhow::Result<Vec<f64>> {
        let MeshOptions { width, cells } = options.parse()?;
        anyhow::ensure!(cells > 0, "a mesh needs at least one cell");

        Ok((0..=cells).map(|i| width * i as f64 / cells as f64).collect())
    }
}

#[derive(Deserialize)]
struct SolveOptions {
    voltage: f64,
}

/// Potential across a parallel plate gap, linear between the plates.
#[derive(Default)]
struct Solve;

impl Reduction for Solve {
    const CLASS: &'static str = "solve";
    type Output = Vec<f64>;

    fn reduce(&self, _: &ReduceContext, options: &Value, inputs: &Inputs) -> anyhow::Result<Vec<f64>> {
        let SolveOptions { voltage } = options.parse()?;
        let mesh: &Vec<f64> = inputs.get(0)?;
        let width = mesh.last().copied().unwrap_or(1.0);

        Ok(mesh.iter().map(|x| voltage * x / width).collect())
    }
}

/// Stored energy per unit area, written out as CSV next to the result.
#[derive(Default)]
struct Energy;

impl Reduction for Energy {
    const CLASS: &'static str = "energy";
    type Output = f64;

    fn reduce(&self, ctx: &ReduceContext, _: &Value, inputs: &Inputs) -> anyhow::Result<f64> {
        let mesh: &Vec<f64> = inputs.get(0)?;
        let potential: &Vec<f64> = inputs.get(1)?;

        let energy: f64 = mesh
            .windows(2)
            .zip(potential.windows(2))
            .map(|(x, v)| {
                let field = (v[1] - v[0]) / (x[1] - x[0]);
                0.5 * field * field * (x[1] - x[0])
            })
            .sum();

        if let Some(path) = ctx.output_path("potential.csv") {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let rows: Vec<String> = mesh
                .iter()
                .zip(potential)
                .map(|(x, v)| format!("{x},{v}"))
                .collect();
            std::fs::write(&path, rows.join("\n"))?;
        }

        Ok(energy)
    }
}

fn registry() -> anyhow::Result<Registry> {
    let mut registry = Registry::new();
    registry
        .register::<Mesh>()?
        .register::<Solve>()?
        .register::<Energy>()?;
    Ok(registry)
}

fn define() -> anyhow::Result<(SweepManager, Task)> {
    let width = Tag::new("width");
    let voltage = Tag::new("voltage");

    let manager = SweepManager::construct_cartesian_product(
        Bindings::new()
            .bind(&width, [1.0, 2.0, 4.0])
            .bind(&voltage, [0.1, 0.2, 0.5, 1.0]),
    )?;

    let mesh = Task::new(Mesh)
        .options(Value::map([("width", Value::from(&width)), ("cells", Value::from(32))]))
        .build();
    let solve = Task::new(Solve)
        .options(Value::map([("voltage", &voltage)]))
        .depends_on(&mesh)
        .build();
    let energy = Task::new(Energy).depends_on(&mesh).depends_on(&solve).build();

    Ok((manager, energy))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    parasweep::init_logging(&args.log)?;

    let (mut manager, root) = match &args.from {
        Some(path) => SweepDescription::load(path)?.rebuild(&registry()?)?,
        None => define()?,
    };

    if let Some(out) = &args.out {
        manager = manager.output_dir(out.join("files"));
        SweepDescription::capture(&manager, &root)?.save(&out.join("sweep.json"))?;
    }

    let strategy = match args.engine {
        Engine::Eager => Strategy::Eager,
        Engine::Delayed => Strategy::Delayed,
        Engine::Inline => Strategy::inline(),
        Engine::Pool => Strategy::pool(args.workers)?,
    };

    let mut run = manager.parallel(true).run(&root, strategy)?;
    let results = run.results()?;

    for (point, energy) in results.points_to_data::<f64>()? {
        let mut coords: Vec<String> = point
            .iter()
            .map(|(tag, value)| format!("{tag}={}", display(value)))
            .collect();
        coords.sort();
        println!("{:<32} {energy:.6}", coords.join(" "));
    }

    if let Some(out) = &args.out {
        let paths = results.persist(&out.join("results"))?;
        tracing::info!(count = paths.len(), "results written");
    }

    println!("{}", run.diagnostics().render_mermaid(&run));
    Ok(())
}

fn display(value: &Value) -> String {
    match value {
        Value::Float(x) => x.to_string(),
        Value::Int(x) => x.to_string(),
        Value::Str(s) => s.clone(),
        other => format!("{other:?}"),
    }
}
