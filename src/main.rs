use bota_engine::import;
use bota_engine::store::Store;
use bota_engine::types::{BunkerRef, Callsign};
use chrono::Utc;

const DEMO_LOG: &str = concat!(
    "<ADIF_VER:5>3.1.4\n",
    "<OPERATOR:6>SP3FCK\n",
    "<EOH>\n",
    "<CALL:6>SP3BLZ <QSO_DATE:8>20250601 <TIME_ON:4>1200 <BAND:3>40M ",
    "<MODE:3>SSB <MY_SIG:6>WWBOTA <MY_SIG_INFO:9>B/SP-0039 <EOR>\n",
    "<CALL:6>SQ3BMJ <QSO_DATE:8>20250601 <TIME_ON:4>1215 <BAND:3>40M ",
    "<MODE:2>CW <MY_SIG:6>WWBOTA <MY_SIG_INFO:9>B/SP-0039 <EOR>\n",
);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut store = Store::new();
    let activator = store
        .create_user(Callsign::new("SP3FCK"), "sp3fck@example.com", Utc::now())
        .expect("register activator");
    store
        .add_bunker(
            BunkerRef::parse("B/SP-0039").expect("valid reference"),
            "Fort IX Poznan",
        )
        .expect("register bunker");

    let outcome = import::process_upload(&mut store, DEMO_LOG, activator, Some("demo.adi"));
    println!(
        "Upload: processed={} duplicates={} hunters={} b2b={}",
        outcome.qsos_processed, outcome.qsos_duplicates, outcome.hunters_updated, outcome.b2b_qsos
    );

    let stats = store.statistics(activator).expect("activator statistics");
    println!(
        "{}: activator_points={} total_points={}",
        "SP3FCK", stats.activator_points, stats.total_points
    );
}
