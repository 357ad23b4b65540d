use bota_engine::adif;
use bota_engine::diploma::DiplomaCatalog;
use bota_engine::import;
use bota_engine::store::Store;
use chrono::Utc;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::process;

fn parse_args() -> Result<HashMap<String, Vec<String>>, String> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    let mut args = env::args().skip(1).peekable();
    while let Some(arg) = args.next() {
        if !arg.starts_with("--") {
            return Err(format!("unexpected argument {arg}"));
        }
        let key = arg.trim_start_matches("--").to_string();
        if key == "json" {
            map.entry(key).or_default();
            continue;
        }
        let val = args
            .next()
            .ok_or_else(|| format!("missing value for --{}", key))?;
        map.entry(key).or_default().push(val);
    }
    Ok(map)
}

fn first(map: &HashMap<String, Vec<String>>, key: &str) -> Option<String> {
    map.get(key).and_then(|values| values.first().cloned())
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let log_path = first(&args, "log").ok_or_else(|| {
        "usage: import_log --log <file.adi> [--bunker-name <name>] \
         [--email <activator email>] [--catalog <diplomas.yaml>] [--json]"
            .to_string()
    })?;
    let raw = fs::read_to_string(&log_path)
        .map_err(|e| format!("failed reading {log_path}: {e}"))?;

    // Pre-scan the log so the demo store can be seeded with the bunker and
    // the activator account the import will expect to exist.
    let parsed = adif::parse(&raw);
    let bunker_ref = parsed
        .bunker_reference()
        .ok_or_else(|| "log carries no bunker reference (MY_SIG_INFO)".to_string())?;
    let activator_call = parsed
        .activator_callsign()
        .ok_or_else(|| "log carries no activator callsign".to_string())?;

    let now = Utc::now();
    let mut store = Store::new();
    let bunker_name = first(&args, "bunker-name").unwrap_or_else(|| bunker_ref.to_string());
    store
        .add_bunker(bunker_ref.clone(), bunker_name)
        .map_err(|e| e.to_string())?;
    let email = first(&args, "email")
        .unwrap_or_else(|| format!("{}@example.com", activator_call.as_str().to_lowercase()));
    let activator = store
        .create_user(activator_call.clone(), email, now)
        .map_err(|e| e.to_string())?;

    if let Some(catalog_path) = first(&args, "catalog") {
        let catalog = DiplomaCatalog::from_path(&catalog_path)?;
        let loaded = store.load_catalog(catalog);
        println!("Loaded {} diploma types from {catalog_path}", loaded.len());
    }

    let filename = log_path.rsplit('/').next().map(str::to_string);
    let outcome = import::process_upload(&mut store, &raw, activator, filename.as_deref());

    if args.contains_key("json") {
        let rendered = serde_json::to_string_pretty(&outcome)
            .map_err(|e| format!("failed rendering outcome: {e}"))?;
        println!("{rendered}");
    } else {
        println!("Activator: {activator_call}  Bunker: {bunker_ref}");
        println!(
            "QSOs processed: {}  duplicates: {}  hunters: {}  B2B flagged: {}",
            outcome.qsos_processed,
            outcome.qsos_duplicates,
            outcome.hunters_updated,
            outcome.b2b_qsos
        );
        for warning in &outcome.warnings {
            println!("warning: {warning}");
        }
        for error in &outcome.errors {
            println!("error: {error}");
        }
    }

    if !outcome.success {
        return Err("upload failed".to_string());
    }

    if let Some(stats) = store.statistics(activator) {
        println!(
            "{activator_call}: activator_points={} hunter_points={} b2b_points={} total={}",
            stats.activator_points, stats.hunter_points, stats.b2b_points, stats.total_points
        );
    }
    for diploma in store.diplomas() {
        let holder = store
            .user(diploma.user)
            .map(|u| u.callsign.to_string())
            .unwrap_or_default();
        println!("Issued {} to {holder}", diploma.serial);
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    if let Err(err) = run() {
        eprintln!("{err}");
        process::exit(1);
    }
}
