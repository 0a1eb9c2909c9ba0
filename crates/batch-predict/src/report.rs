use crate::error::PredictError;
use crate::predict::PredictionRecord;
use clap::ValueEnum;
use itertools::Itertools;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
	#[default]
	Json,
	Csv,
}

impl fmt::Display for OutputFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			OutputFormat::Json => write!(f, "JSON"),
			OutputFormat::Csv => write!(f, "CSV"),
		}
	}
}

pub fn write_json<W: Write>(writer: W, results: &[PredictionRecord]) -> Result<(), PredictError> {
	let mut writer = writer;
	serde_json::to_writer_pretty(&mut writer, results)?;
	writer.flush()?;
	Ok(())
}

pub fn write_csv<W: Write>(writer: W, results: &[PredictionRecord]) -> Result<(), PredictError> {
	let mut writer = csv::WriterBuilder::new()
		.terminator(csv::Terminator::CRLF)
		.from_writer(writer);

	writer.write_record(["Image Path", "Predicted Class", "Confidence"])?;
	for record in results {
		let confidence = format!("{:.4}", record.confidence);
		writer.write_record([
			record.image_path.as_str(),
			record.predicted_class.as_str(),
			confidence.as_str(),
		])?;
	}
	writer.flush()?;

	Ok(())
}

pub fn save_results(results: &[PredictionRecord], path: &Path, format: OutputFormat) -> Result<(), PredictError> {
	let file = BufWriter::new(File::create(path)?);
	match format {
		OutputFormat::Json => write_json(file, results)?,
		OutputFormat::Csv => write_csv(file, results)?,
	}

	println!("Results saved to {} ({format} format)", path.display());
	Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassCount {
	pub class: String,
	pub count: usize,
	pub percentage: f64,
}

/// How many images landed in each class, most frequent first.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
	pub total: usize,
	pub classes: Vec<ClassCount>,
}

pub fn summarize(results: &[PredictionRecord]) -> Summary {
	let total = results.len();
	let counts = results.iter().map(|r| r.predicted_class.as_str()).counts();

	let mut classes = results
		.iter()
		.map(|r| r.predicted_class.as_str())
		.unique()
		.map(|class| {
			let count = counts[class];
			ClassCount {
				class: class.to_string(),
				count,
				percentage: count as f64 / total as f64 * 100.0,
			}
		})
		.collect::<Vec<_>>();
	// stable, so ties stay in first seen order
	classes.sort_by(|a, b| b.count.cmp(&a.count));

	Summary { total, classes }
}

impl fmt::Display for Summary {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let rule = "=".repeat(50);
		writeln!(f, "{rule}")?;
		writeln!(f, "SUMMARY")?;
		writeln!(f, "{rule}")?;
		writeln!(f, "Total images processed: {}", self.total)?;
		writeln!(f)?;
		writeln!(f, "Predictions by class:")?;
		for class in &self.classes {
			writeln!(f, "  {}: {} ({:.1}%)", class.class, class.count, class.percentage)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::tempdir;

	fn record(path: &str, class: &str, probabilities: &[(&str, f64)]) -> PredictionRecord {
		let confidence = probabilities
			.iter()
			.find(|(label, _)| *label == class)
			.map(|(_, p)| *p)
			.unwrap();
		PredictionRecord {
			image_path: path.to_string(),
			predicted_class: class.to_string(),
			confidence,
			all_probabilities: probabilities.iter().map(|(l, p)| (l.to_string(), *p)).collect(),
		}
	}

	#[test]
	fn json_keeps_label_order() {
		let results = vec![record("imgs/z.png", "zebra", &[("zebra", 0.75), ("aardvark", 0.25)])];

		let mut out = Vec::new();
		write_json(&mut out, &results).unwrap();
		let text = String::from_utf8(out).unwrap();

		assert!(text.starts_with("[\n  {\n    \"image_path\": \"imgs/z.png\""));
		assert!(text.find("\"zebra\": 0.75").unwrap() < text.find("\"aardvark\": 0.25").unwrap());

		let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
		assert_eq!(parsed[0]["predicted_class"], "zebra");
		assert_eq!(parsed[0]["confidence"], 0.75);
	}

	#[test]
	fn csv_is_byte_exact() {
		let results = vec![
			record("a.jpg", "cat", &[("cat", 0.98766), ("dog", 0.01234)]),
			record("b, c.jpg", "dog", &[("cat", 0.5), ("dog", 0.5)]),
		];

		let mut out = Vec::new();
		write_csv(&mut out, &results).unwrap();

		assert_eq!(
			String::from_utf8(out).unwrap(),
			"Image Path,Predicted Class,Confidence\r\na.jpg,cat,0.9877\r\n\"b, c.jpg\",dog,0.5000\r\n"
		);
	}

	#[test]
	fn save_results_writes_the_requested_format() {
		let dir = tempdir().unwrap();
		let results = vec![record("a.jpg", "cat", &[("cat", 1.0)])];

		let json = dir.path().join("out.json");
		save_results(&results, &json, OutputFormat::Json).unwrap();
		assert!(fs::read_to_string(&json).unwrap().starts_with('['));

		let csv = dir.path().join("out.csv");
		save_results(&results, &csv, OutputFormat::Csv).unwrap();
		assert!(fs::read_to_string(&csv).unwrap().starts_with("Image Path,"));
	}

	#[test]
	fn summary_sorts_by_count_then_first_seen() {
		let probabilities = [("dog", 0.5), ("cat", 0.5), ("bird", 0.5)];
		let results = ["dog", "cat", "cat", "bird", "dog", "bird", "cat"]
			.iter()
			.map(|class| record("x.png", class, &probabilities))
			.collect::<Vec<_>>();

		let summary = summarize(&results);
		let order = summary.classes.iter().map(|c| c.class.as_str()).collect::<Vec<_>>();
		assert_eq!(order, vec!["cat", "dog", "bird"]);

		assert_eq!(
			summary.to_string(),
			format!(
				"{rule}\nSUMMARY\n{rule}\nTotal images processed: 7\n\nPredictions by class:\n  cat: 3 (42.9%)\n  dog: 2 (28.6%)\n  bird: 2 (28.6%)\n",
				rule = "=".repeat(50)
			)
		);
	}

	#[test]
	fn empty_summary_has_no_classes() {
		let summary = summarize(&[]);
		assert_eq!(summary.total, 0);
		assert!(summary.classes.is_empty());
	}
}
