use nvme_fuzz::nvme::TEMPLATES;

/// Print the known NVMe command templates and their dispatch parameters.
#[derive(Debug, clap::Parser)]
pub(super) struct ListCommandsCommand {
    /// Also show the destructive templates that need --all-commands.
    #[clap(long)]
    all: bool,
}

impl ListCommandsCommand {
    pub(super) fn run(self) -> anyhow::Result<()> {
        println!(
            "{:<24} {:>6}  {:<6} {:>3} {:>4}  {:<10} {}",
            "Name", "Opcode", "Class", "Ns", "Data", "Timeout", "Enabled"
        );
        for template in &TEMPLATES {
            if template.destructive && !self.all {
                continue;
            }
            println!(
                "{:<24} {:>#6x}  {:<6} {:>3} {:>4}  {:<10} {}",
                template.name,
                template.opcode,
                template.class.passthru_subcommand().trim_end_matches("-passthru"),
                if template.needs_namespace { "yes" } else { "no" },
                if template.needs_data { "yes" } else { "no" },
                format!("{:?}", template.timeout_group).to_lowercase(),
                if template.destructive {
                    "opt-in (--all-commands)"
                } else {
                    "default"
                }
            );
        }
        Ok(())
    }
}
