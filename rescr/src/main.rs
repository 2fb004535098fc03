use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use rescr_core::device::Device;
use rescr_core::error::RecoveryError;
use rescr_core::exec::Executor;
use rescr_core::flash::{FlashEvent, Flasher};
use rescr_core::journal::Journal;
use rescr_core::retry::{self, RetryPolicy};
use rescr_core::{backup, net, platform};
use std::fs;
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "rescr")]
#[command(about = "An interactive disk-recovery toolkit", version)]
struct Cli {
    /// Journal file recording every recovery event
    #[arg(long, global = true, default_value = "recovery.log")]
    journal: PathBuf,

    /// Times the whole flash is attempted before giving up
    #[arg(long, global = true, default_value_t = RetryPolicy::flashing().attempts)]
    flash_attempts: u32,

    /// Seconds to pause between retry attempts
    #[arg(long, global = true, default_value_t = RetryPolicy::flashing().delay.as_secs())]
    retry_delay: u64,

    /// Host probed by the network check
    #[arg(long, global = true, default_value = net::DEFAULT_PROBE_HOST)]
    probe_host: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a file into a backup directory
    Backup {
        /// File to back up
        #[arg(required = true)]
        file: PathBuf,

        /// Directory receiving the copy, created if missing
        #[arg(short = 'd', long = "dir", default_value = "backups")]
        dir: PathBuf,
    },
    /// Restore a previously taken backup over a target path
    Restore {
        /// Backup file to copy back
        #[arg(required = true)]
        backup: PathBuf,

        /// Where to restore it to
        #[arg(required = true)]
        target: PathBuf,
    },
    /// Run a shell command, journalling its outcome
    Run {
        /// Command line passed to `sh -c`
        #[arg(required = true)]
        command: String,

        /// Kill the command if it runs longer than this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Check whether the network is reachable
    Net,
    /// Flash an image to a device, retrying through fallback methods
    Flash {
        /// Image file (.iso, .torrent, or a .gz/.xz/.zst compressed image)
        #[arg(required = true)]
        image: PathBuf,

        /// Target device; selected interactively when omitted
        #[arg(long)]
        device: Option<PathBuf>,

        /// Skip post-write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Offer internal disks as targets too
        #[arg(long)]
        include_fixed: bool,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// List candidate target devices
    List {
        /// Include internal disks
        #[arg(long)]
        include_fixed: bool,
    },
}

/// Disables `ECHOCTL` while the process runs so a Ctrl-C does not smear
/// `^C` across the progress display. The saved terminal state is put back
/// when this guard is dropped.
struct TermRestorer {
    #[cfg(unix)]
    saved: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self { saved: None };
            }
            let fd = stdout().as_raw_fd();
            let Ok(saved) = Termios::from_fd(fd) else {
                return Self { saved: None };
            };

            let mut quiet = saved;
            quiet.c_lflag &= !ECHOCTL;
            if tcsetattr(fd, TCSANOW, &quiet).is_err() {
                return Self { saved: None };
            }
            Self { saved: Some(saved) }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(saved) = self.saved {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, &saved).ok();
        }
    }
}

/// Lets the user pick a discovered device or type a path by hand.
fn select_device(devices: &[Device], prompt: &str) -> Result<PathBuf> {
    let mut items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    items.push("Somewhere else (type a device path)".to_string());

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    if selection == devices.len() {
        let path: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Device path")
            .interact_text()?;
        Ok(PathBuf::from(path))
    } else {
        Ok(devices[selection].path.clone())
    }
}

/// Presents a final "Yes/No" confirmation, defaulting to No.
fn confirm(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

struct App {
    journal: Arc<Journal>,
    running: Arc<AtomicBool>,
    flash_attempts: u32,
    retry_delay: Duration,
    probe_host: String,
}

impl App {
    fn do_backup(&self, file: &Path, dir: &Path) -> Result<()> {
        // The menu loop recovers only from RecoveryError failures.
        fs::create_dir_all(dir).map_err(|e| {
            RecoveryError::io(format!("creating backup directory {}", dir.display()), e)
        })?;
        let saved = backup::backup(&self.journal, file, dir)?;
        println!("Backed up to {}.", style(saved.display()).cyan());
        Ok(())
    }

    fn do_restore(&self, backup_file: &Path, target: &Path) -> Result<()> {
        let restored = backup::restore(&self.journal, backup_file, target)?;
        println!("Restored to {}.", style(restored.display()).cyan());
        Ok(())
    }

    fn do_run(&self, line: &str, timeout: Option<Duration>) -> Result<()> {
        let mut exec = Executor::new(Arc::clone(&self.journal));
        if let Some(limit) = timeout {
            exec = exec.with_timeout(limit);
        }

        let output = exec.shell(line)?;
        if !output.is_empty() {
            print!("{output}");
            if !output.ends_with('\n') {
                println!();
            }
        }
        Ok(())
    }

    fn do_net(&self) -> Result<()> {
        let exec = Executor::new(Arc::clone(&self.journal));
        if net::check_reachable(&exec, &self.probe_host)? {
            println!(
                "{} {} answered the probe; network is reachable.",
                style("✔").green(),
                style(&self.probe_host).cyan()
            );
        } else {
            println!(
                "{} {} did not answer; network looks down.",
                style("✘").red(),
                style(&self.probe_host).cyan()
            );
        }
        Ok(())
    }

    fn do_list(&self, include_fixed: bool) -> Result<()> {
        let devices = platform::discover_devices(include_fixed)?;
        if devices.is_empty() {
            println!("No candidate devices found.");
            return Ok(());
        }

        println!("Found {} candidate devices:", devices.len());
        println!(
            "\n  {:<12} {:<12} {:<10} {:<10} {}",
            "DEVICE", "NAME", "SIZE", "KIND", "LOCATION"
        );
        println!("  {:-<12} {:-<12} {:-<10} {:-<10} {:-<20}", "", "", "", "", "");
        for device in devices {
            let kind = if device.removable { "removable" } else { "internal" };
            let location = device.mount_point.as_deref().unwrap_or("(not mounted)");
            println!(
                "  {:<12} {:<12} {:>7.1} GB {:<10} {}",
                device.path.display(),
                device.name,
                device.size_gb(),
                kind,
                location
            );
        }
        Ok(())
    }

    fn do_flash(
        &self,
        image: &Path,
        device: Option<PathBuf>,
        no_verify: bool,
        include_fixed: bool,
        yes: bool,
    ) -> Result<()> {
        let target = match device {
            Some(path) => path,
            None => {
                let devices = platform::discover_devices(include_fixed)?;
                if devices.is_empty() {
                    println!("No candidate devices found; you can still type a path.");
                }
                select_device(&devices, "Select the device to flash")?
            }
        };

        println!(
            "{} This will overwrite all data on {}.",
            style("WARNING:").red().bold(),
            style(target.display()).cyan()
        );
        println!("  Image: {}", style(image.display()).cyan());
        println!();

        if !yes && !confirm("Are you sure you want to proceed?")? {
            println!("Flash cancelled.");
            return Ok(());
        }
        println!();

        self.flash_with_progress(image, &target, no_verify)
    }

    fn flash_with_progress(&self, image: &Path, device: &Path, no_verify: bool) -> Result<()> {
        let is_compressed = image.extension().and_then(|e| e.to_str()).map_or(false, |e| {
            matches!(
                e.to_lowercase().as_str(),
                "gz" | "gzip" | "xz" | "zst" | "zstd"
            )
        });

        let decompress_pb = if is_compressed {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        let write_pb = ProgressBar::new(0);
        let verify_pb = if no_verify {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };

        let flasher = Flasher::new(Arc::clone(&self.journal))
            .verify(!no_verify)
            .running(Arc::clone(&self.running))
            .on_event({
                let decompress_pb = decompress_pb.clone();
                let write_pb = write_pb.clone();
                let verify_pb = verify_pb.clone();
                move |event| match event {
                    FlashEvent::DecompressStarted => {
                        decompress_pb.set_prefix("Decompress");
                        decompress_pb.set_style(
                            ProgressStyle::default_spinner()
                                .template(
                                    "{prefix:12} [{elapsed_precise}] {spinner} {bytes} ({bytes_per_sec})",
                                )
                                .unwrap(),
                        );
                        decompress_pb.enable_steady_tick(Duration::from_millis(100));
                    }
                    FlashEvent::DecompressProgress(bytes) => decompress_pb.set_position(bytes),
                    FlashEvent::ConvertStarted => {
                        println!("Converting the torrent to an ISO first...");
                    }
                    FlashEvent::MethodStarted { name } => {
                        if is_compressed && !decompress_pb.is_finished() {
                            decompress_pb.finish_with_message("Decompression complete.");
                        }
                        write_pb.reset();
                        write_pb.set_message(name.to_string());
                    }
                    FlashEvent::WriteStarted(len) => {
                        write_pb.set_length(len);
                        write_pb.set_prefix("Writing");
                        write_pb.set_style(
                            ProgressStyle::default_bar()
                                .template(
                                    "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
                                )
                                .unwrap()
                                .progress_chars("■ "),
                        );
                    }
                    FlashEvent::WriteProgress(bytes) => write_pb.set_position(bytes),
                    FlashEvent::VerifyStarted(len) => {
                        verify_pb.reset();
                        verify_pb.set_length(len);
                        verify_pb.set_prefix("Verifying");
                        verify_pb.set_style(
                            ProgressStyle::default_bar()
                                .template(
                                    "{prefix:12} [{elapsed_precise}] [{bar:40.magenta/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                                )
                                .unwrap()
                                .progress_chars("■ "),
                        );
                    }
                    FlashEvent::VerifyProgress(bytes) => verify_pb.set_position(bytes),
                }
            });

        let policy = RetryPolicy {
            attempts: self.flash_attempts,
            delay: self.retry_delay,
        };
        let result = retry::retry(&self.journal, policy, "flash", || {
            flasher.flash(image, device)
        });

        match result {
            Ok(()) => {
                write_pb.finish_with_message("Write complete.");
                if !no_verify {
                    verify_pb.finish_with_message("Verification successful.");
                }
                println!(
                    "\n✨ Successfully flashed {} with {}.",
                    style(device.display()).cyan(),
                    style(image.display()).cyan()
                );
                Ok(())
            }
            Err(e) => {
                // Unblock the terminal before reporting.
                decompress_pb.finish_and_clear();
                write_pb.finish_and_clear();
                verify_pb.finish_and_clear();
                Err(e.into())
            }
        }
    }

    fn menu_backup(&self) -> Result<()> {
        let file: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("File to back up")
            .interact_text()?;
        let dir: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Backup directory")
            .default("backups".into())
            .interact_text()?;
        self.do_backup(Path::new(&file), Path::new(&dir))
    }

    fn menu_restore(&self) -> Result<()> {
        let backup_file: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Backup file to restore")
            .interact_text()?;
        let target: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Restore to")
            .interact_text()?;
        self.do_restore(Path::new(&backup_file), Path::new(&target))
    }

    fn menu_run(&self) -> Result<()> {
        let line: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Command to run")
            .interact_text()?;
        self.do_run(&line, None)
    }

    fn menu_flash(&self) -> Result<()> {
        let image: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Image to flash (.iso, .torrent, or compressed)")
            .interact_text()?;
        self.do_flash(Path::new(&image), None, false, false, false)
    }

    /// The interactive shell: one action per loop iteration, until Quit.
    ///
    /// Recovery failures are reported and the menu comes back; anything
    /// else (a broken terminal, say) aborts the program.
    fn menu(&self) -> Result<()> {
        println!("{}", style("rescr recovery shell").bold());
        println!(
            "Journal: {}",
            style(self.journal.path().display()).dim()
        );

        loop {
            println!();
            let choice = Select::with_theme(&ColorfulTheme::default())
                .with_prompt("What needs doing?")
                .items(&[
                    "Back up a file",
                    "Restore a backup",
                    "Run a command",
                    "Check the network",
                    "Flash an image",
                    "Quit",
                ])
                .default(0)
                .interact()?;

            let outcome = match choice {
                0 => self.menu_backup(),
                1 => self.menu_restore(),
                2 => self.menu_run(),
                3 => self.do_net(),
                4 => self.menu_flash(),
                _ => {
                    self.journal.info("recovery session finished");
                    return Ok(());
                }
            };

            if let Err(err) = outcome {
                match err.downcast::<RecoveryError>() {
                    Ok(recovery) => {
                        // A Ctrl-C only cancels the operation, not the shell.
                        if matches!(recovery, RecoveryError::Cancelled) {
                            self.running.store(true, Ordering::SeqCst);
                        }
                        println!("{} {recovery}", style("error:").red().bold());
                    }
                    Err(other) => return Err(other),
                }
            }
        }
    }
}

fn main() -> Result<()> {
    // Dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // Cleared by Ctrl-C; long operations poll it and bail out.
    let running = Arc::new(AtomicBool::new(true));
    let watcher = Arc::clone(&running);
    ctrlc::set_handler(move || {
        watcher.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();

    let journal = Arc::new(Journal::open(&cli.journal)?);
    journal.info("recovery session started");

    let app = App {
        journal,
        running,
        flash_attempts: cli.flash_attempts,
        retry_delay: Duration::from_secs(cli.retry_delay),
        probe_host: cli.probe_host,
    };

    match cli.command {
        Some(Commands::Backup { file, dir }) => app.do_backup(&file, &dir),
        Some(Commands::Restore { backup, target }) => app.do_restore(&backup, &target),
        Some(Commands::Run { command, timeout }) => {
            app.do_run(&command, timeout.map(Duration::from_secs))
        }
        Some(Commands::Net) => app.do_net(),
        Some(Commands::Flash {
            image,
            device,
            no_verify,
            include_fixed,
            yes,
        }) => app.do_flash(&image, device, no_verify, include_fixed, yes),
        Some(Commands::List { include_fixed }) => app.do_list(include_fixed),
        None => app.menu(),
    }
}
