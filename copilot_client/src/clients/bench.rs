//! Benchmarking client running closed-loop workers, each owning its own
//! CoPilot session.

use rand::distributions::Alphanumeric;
use rand::Rng;

use serde::Deserialize;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};

use copilot::{
    logged_err, parsed_config, pf_info, pf_warn, CopilotClient, CopilotError,
    StaticDirectory, KEY_SIZE, VALUE_SIZE,
};

/// Mode parameters struct.
#[derive(Debug, Deserialize)]
pub struct ModeParamsBench {
    /// Number of concurrent closed-loop workers.
    pub num_workers: usize,

    /// Time length to benchmark in seconds.
    pub length_s: u64,

    /// Percentage of put requests.
    pub put_ratio: u8,

    /// Number of distinct keys to choose from.
    pub num_keys: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for ModeParamsBench {
    fn default() -> Self {
        ModeParamsBench {
            num_workers: 4,
            length_s: 30,
            put_ratio: 50,
            num_keys: 1000,
        }
    }
}

/// Benchmarking client struct.
pub struct ClientBench {
    /// Directory shared (cloned) by every worker.
    directory: StaticDirectory,

    /// Client configuration TOML string handed to every worker's session.
    config_str: Option<String>,

    /// Mode parameters struct.
    params: ModeParamsBench,

    /// Termination signal receiver, cloned into every worker.
    rx_term: watch::Receiver<bool>,
}

impl ClientBench {
    /// Creates a new benchmarking client.
    pub fn new(
        directory: StaticDirectory,
        config_str: Option<String>,
        params_str: Option<&str>,
        rx_term: watch::Receiver<bool>,
    ) -> Result<Self, CopilotError> {
        let params = parsed_config!(params_str => ModeParamsBench;
                                    num_workers, length_s,
                                    put_ratio, num_keys)?;
        if params.num_workers == 0 {
            return logged_err!(
                "invalid params.num_workers '{}'",
                params.num_workers
            );
        }
        if params.length_s == 0 {
            return logged_err!("invalid params.length_s '{}'", params.length_s);
        }
        if params.put_ratio > 100 {
            return logged_err!(
                "invalid params.put_ratio '{}'",
                params.put_ratio
            );
        }
        if params.num_keys == 0 {
            return logged_err!("invalid params.num_keys '{}'", params.num_keys);
        }

        Ok(ClientBench {
            directory,
            config_str,
            params,
            rx_term,
        })
    }

    /// Generates the pool of keys workers pick from.
    fn gen_keys(num_keys: usize) -> Vec<String> {
        (0..num_keys)
            .map(|i| {
                let mut key = format!("key{}", i);
                key.truncate(KEY_SIZE);
                key
            })
            .collect()
    }

    /// Generates a random alphanumeric value of full width.
    fn gen_value() -> Vec<u8> {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(VALUE_SIZE)
            .collect()
    }

    /// Closed-loop worker: issues one request at a time until the length is
    /// reached or termination is signalled. Returns the number of completed
    /// requests.
    async fn worker(
        mut directory: StaticDirectory,
        config_str: Option<String>,
        keys: Vec<String>,
        put_ratio: u8,
        length: Duration,
        rx_term: watch::Receiver<bool>,
    ) -> Result<u64, CopilotError> {
        let mut client = CopilotClient::new_and_setup(
            &mut directory,
            config_str.as_deref(),
            rx_term.clone(),
        )
        .await?;

        let value = Self::gen_value();
        let start = Instant::now();
        let mut completed = 0;
        while start.elapsed() < length && !*rx_term.borrow() {
            let (key, is_put) = {
                let mut rng = rand::thread_rng();
                (
                    &keys[rng.gen_range(0..keys.len())],
                    rng.gen_range(0..100) < put_ratio,
                )
            };
            let result = if is_put {
                client.put(key.as_bytes(), &value).await
            } else {
                client.get(key.as_bytes()).await.map(|_| ())
            };
            match result {
                Ok(()) => completed += 1,
                Err(_) if *rx_term.borrow() => break,
                Err(e) => return Err(e),
            }
        }

        Ok(completed)
    }

    /// Runs the benchmark for the given time length.
    pub async fn run(&mut self) -> Result<(), CopilotError> {
        let keys = Self::gen_keys(self.params.num_keys);
        let length = Duration::from_secs(self.params.length_s);
        let start = Instant::now();

        let mut workers = JoinSet::new();
        for _ in 0..self.params.num_workers {
            workers.spawn(Self::worker(
                self.directory.clone(),
                self.config_str.clone(),
                keys.clone(),
                self.params.put_ratio,
                length,
                self.rx_term.clone(),
            ));
        }

        let mut total = 0;
        let mut failed = 0;
        while let Some(joined) = workers.join_next().await {
            match joined.map_err(CopilotError::msg)? {
                Ok(completed) => total += completed,
                Err(e) => {
                    pf_warn!("bench worker failed: {}", e);
                    failed += 1;
                }
            }
        }

        println!(
            "{:^11} | {:^8} | {:^12}",
            "Elapsed (s)", "Workers", "Completed"
        );
        println!(
            "{:>11.2} | {:>8} | {:>12}",
            start.elapsed().as_secs_f64(),
            self.params.num_workers - failed,
            total
        );
        pf_info!("bench done: {} requests completed", total);

        if failed == self.params.num_workers {
            return logged_err!("all {} bench workers failed", failed);
        }
        Ok(())
    }
}
