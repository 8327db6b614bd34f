pub mod node_cache;
pub mod parse_osm;
pub mod way_batch;

use log::{debug, error};

use crate::errors::Result;

/// A unit of work run as extract, transform and load, with the stage name on
/// every log line.
pub trait Etl {
    type Input;
    type Output;

    fn etl_name(&self) -> &str;

    fn extract(&mut self) -> Result<Self::Input>;
    fn transform(&mut self, input: Self::Input) -> Result<Self::Output>;
    fn load(&mut self, output: Self::Output) -> Result<()>;

    /// Runs the three steps in order. The first failing step is logged and
    /// ends the run.
    fn process(&mut self) -> Result<()> {
        let name = self.etl_name().to_string();
        debug!(etl_name = name.as_str(); "Stage started");

        let input = step(&name, "extract", self.extract())?;
        let output = step(&name, "transform", self.transform(input))?;
        step(&name, "load", self.load(output))?;

        debug!(etl_name = name.as_str(); "Stage done");
        Ok(())
    }
}

fn step<T>(etl_name: &str, step: &str, outcome: Result<T>) -> Result<T> {
    match &outcome {
        Ok(_) => debug!(etl_name = etl_name, step = step; "Step done"),
        Err(err) => {
            let msg = err.to_string();
            error!(etl_name = etl_name, step = step, err = msg.as_str(); "Step failed");
        }
    }
    outcome
}
