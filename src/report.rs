//! Terminal reporting: live progress and the end-of-run summary.

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;

use crate::event::{EventBus, TestrunEvent};
use crate::hub::{TestrunStatus, TestrunSummary};
use crate::results::Verdict;

/// Prints a summary of a finished testrun to the console.
///
/// Displays task and case counts with colored output and a final status
/// line.
pub fn print_summary(summary: &TestrunSummary) {
    let significant: usize = summary
        .package_results
        .iter()
        .map(|r| r.significant().len())
        .sum();
    let insignificant: usize = summary
        .package_results
        .iter()
        .map(|r| r.insignificant().len())
        .sum();
    let finished = summary.tasks.iter().filter(|t| t.is_finished()).count();

    println!();
    println!("Testrun {}:", summary.testrun_id);
    println!("  Tasks:    {}/{} finished", finished, summary.tasks.len());
    println!("  Packages: {}", summary.package_results.len());
    println!(
        "  Cases:    {} significant, {} insignificant",
        significant, insignificant
    );
    if !summary.schema_failures.is_empty() {
        println!(
            "  Invalid:  {}",
            console::style(summary.schema_failures.len()).red().bold()
        );
    }
    println!("  Duration: {:?}", summary.duration);
    println!();

    match &summary.status {
        TestrunStatus::Verdict(Verdict::Pass) => {
            println!("{}", console::style("PASS").green().bold());
        }
        TestrunStatus::Verdict(Verdict::Fail) => {
            println!("{}", console::style("FAIL").red().bold());
        }
        TestrunStatus::Verdict(Verdict::NoCases) => {
            println!("{}", console::style("NO_CASES").yellow().bold());
            println!(
                "{}",
                console::style("No results contributed to the verdict.").dim()
            );
        }
        TestrunStatus::Failed(error) => {
            println!("{}", console::style(format!("ERROR: {error}")).red().bold());
            if !summary.package_results.is_empty() {
                println!(
                    "{}",
                    console::style("Partial results above were still collected.").dim()
                );
            }
        }
    }
}

/// Progress bar fed from a testrun's event channel.
///
/// Tracks finished tasks against the dispatched total and notes arriving
/// documents in the bar message. Detaches automatically when the testrun
/// ends.
pub struct ProgressObserver {
    bar: ProgressBar,
    handle: JoinHandle<()>,
}

impl ProgressObserver {
    /// Subscribes to `bus` and renders progress for `total_tasks` tasks.
    pub fn attach(bus: &EventBus, total_tasks: u64) -> Self {
        let bar = ProgressBar::new(total_tasks);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tasks {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );

        let mut rx = bus.subscribe();
        let task_bar = bar.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TestrunEvent::TaskFinished { .. }) => task_bar.inc(1),
                    Ok(TestrunEvent::DocumentReceived { package, .. }) => {
                        task_bar.set_message(package);
                    }
                    Ok(TestrunEvent::Ended) => break,
                    // A lagged receiver just misses cosmetic updates.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Ok(_) => {}
                }
            }
        });

        Self { bar, handle }
    }

    /// Waits for the event stream to end and clears the bar.
    pub async fn finish(self) {
        let _ = self.handle.await;
        self.bar.finish_and_clear();
    }
}
