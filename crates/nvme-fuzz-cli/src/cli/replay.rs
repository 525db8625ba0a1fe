use std::{fs, path::PathBuf, sync::Arc};

use anyhow::Context;
use nvme_fuzz::{
    config::FuzzConfig,
    corpus::Seed,
    nvme::{self, NvmeCliTransport, PassthruTransport, build_request},
    probe::ProbeSession,
    sampler::{PcSampler, SamplerSettings},
};
use tracing::info;

use super::GlobalOptions;

/// Re-send one saved corpus or crash input exactly once, with sampling,
/// and report the coverage it produced.
#[derive(Debug, clap::Parser)]
pub(super) struct ReplayCommand {
    /// Payload file (a corpus `input_*` or crash `crash_*` artifact).
    input: PathBuf,

    /// Template name to replay the payload under.
    #[clap(long)]
    command: String,

    /// JSON configuration file for probe and device parameters.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Override the opcode actually sent.
    #[clap(long)]
    opcode: Option<u8>,
}

impl ReplayCommand {
    pub(super) fn run(self, _global_options: GlobalOptions) -> anyhow::Result<()> {
        let config = match &self.config {
            Some(path) => FuzzConfig::load(path)?,
            None => FuzzConfig::default(),
        };
        config.validate().context("Validating configuration")?;

        let template = nvme::find_template(&self.command)
            .with_context(|| format!("Unknown command template {}", self.command))?;
        let payload = fs::read(&self.input).context("Reading input payload")?;

        let mut seed = Seed::new(
            payload,
            Arc::new(template.clone()),
            nvme::protocol_sane_dwords(template.name),
        );
        seed.overrides.opcode = self.opcode;
        let request = build_request(&seed, &config);
        info!(
            command = %request.command,
            opcode = format_args!("{:#04x}", request.opcode),
            data_len = request.data_len,
            timeout_ms = request.timeout_ms,
            "replaying input"
        );

        let probe = Arc::new(ProbeSession::connect(&config).context("Connecting to debug probe")?);
        let mut sampler = PcSampler::new(Arc::clone(&probe), SamplerSettings::from_config(&config));
        let mut transport = NvmeCliTransport::new(&config);

        sampler.start(Arc::new(Default::default()))?;
        let outcome = transport.execute(&request, &seed.payload);
        let run = sampler.stop();

        println!("Outcome: {outcome:?}");
        println!(
            "Samples: {} ({} out of range, {} failed reads)",
            run.samples, run.out_of_range, run.failed_reads
        );
        println!("Edges: {}, PCs: {}", run.edges.len(), run.pcs.len());
        if let Some(reason) = run.stop_reason {
            println!("Sampler stop reason: {reason}");
        }
        Ok(())
    }
}
