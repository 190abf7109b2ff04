use flash_sale_loadtest::prelude::*;

/// Exit code when one or more thresholds were crossed.
const THRESHOLDS_CROSSED: i32 = 99;

#[tokio::main]
async fn main() {
    let load_test = match LoadTest::initialize() {
        Ok(load_test) => load_test,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let scenario = FlashSaleScenario::new(load_test.configuration());
    match load_test.execute(scenario).await {
        Ok(metrics) => {
            if !metrics.thresholds_passed() {
                log::error!("some thresholds have been crossed");
                std::process::exit(THRESHOLDS_CROSSED);
            }
        }
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    }
}
