//! Tabular output of the informational commands.

use csv_core::WriteResult;
use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("a CSV field could not be encoded")]
    EncodeCsv,
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<dyn std::io::Write>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        Ok(Output::new(self.format, io, self.output))
    }
}

pub struct Output {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv,
    Table { comfy: comfy_table::Table },
    Jsonl,
}

impl Output {
    fn new(format: Format, io: Box<dyn std::io::Write>, path: Option<PathBuf>) -> Self {
        let formatter = match format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv,
        };
        Output { path, io, formatter }
    }

    /// Column names. Must precede all the records.
    pub fn table_headers(&mut self, headers: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv => self.write_csv_row(&headers)?,
            Formatter::Table { comfy } => {
                comfy.set_header(headers);
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn write_csv_row<V: std::ops::Deref<Target = str>>(&mut self, values: &[V]) -> Result<(), Error> {
        // Quoting at most doubles a field, plus the quotes and the separator.
        let max_len = 3 + 2 * values.iter().map(|v| v.len()).max().unwrap_or(0);
        let mut buffer = vec![0; max_len];
        let mut writer = csv_core::Writer::new();
        for (index, value) in values.iter().enumerate() {
            if index != 0 {
                let (WriteResult::InputEmpty, written) = writer.delimiter(&mut buffer) else {
                    return Err(Error::EncodeCsv);
                };
                self.io.write_all(&buffer[..written]).map_err(|e| self.write_error(e))?;
            }
            let (WriteResult::InputEmpty, read, written) = writer.field(value.as_bytes(), &mut buffer)
            else {
                return Err(Error::EncodeCsv);
            };
            debug_assert_eq!(read, value.len());
            self.io.write_all(&buffer[..written]).map_err(|e| self.write_error(e))?;
        }
        let (WriteResult::InputEmpty, written) = writer.terminator(&mut buffer) else {
            return Err(Error::EncodeCsv);
        };
        self.io.write_all(&buffer[..written]).map_err(|e| self.write_error(e))
    }

    /// Output a single record, either as a table/CSV row or as a JSON line.
    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv => {
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(table_row());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy } = &self.formatter {
            writeln!(self.io, "{comfy}").map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}
