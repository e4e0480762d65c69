//! Document Extractor: vendor document bytes to line items.

use crate::config::ImportLimits;
use crate::error::ImportError;
use crate::import::amount::parse_amount;
use crate::import::json_span::first_balanced_object;
use crate::models::{ExtractedLineItem, RowError};
use crate::services::metrics::{record_ai_call, record_import_stage};
use crate::services::providers::{DocumentContext, GenerationParams, ProviderError, TextProvider};
use calamine::{open_workbook_auto_from_rs, Data, DataType, Reader};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;
use validator::Validate;

/// Header substrings every spreadsheet must carry, matched case-insensitively.
const REQUIRED_COLUMNS: [&str; 5] = ["property", "date", "description", "vendor", "amount"];

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d-%b-%Y"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Csv,
    Workbook,
}

impl DocumentKind {
    /// Classify an upload by extension first, then by declared content type.
    pub fn detect(content_type: Option<&str>, file_name: &str) -> Result<Self, ImportError> {
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => return Ok(Self::Pdf),
            "csv" => return Ok(Self::Csv),
            "xlsx" | "xlsm" | "xls" | "ods" => return Ok(Self::Workbook),
            _ => {}
        }

        let mime = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match mime.as_str() {
            "application/pdf" => Ok(Self::Pdf),
            "text/csv" | "application/csv" => Ok(Self::Csv),
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.ms-excel"
            | "application/vnd.oasis.opendocument.spreadsheet" => Ok(Self::Workbook),
            _ => Err(ImportError::Validation(format!(
                "Unsupported document type for '{}': upload a PDF, CSV or spreadsheet",
                file_name
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Csv => "csv",
            Self::Workbook => "workbook",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadedDocument {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Line items read from one document plus the rows that could not be read.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub kind: DocumentKind,
    pub items: Vec<ExtractedLineItem>,
    pub row_errors: Vec<RowError>,
}

pub struct DocumentExtractor {
    provider: Arc<dyn TextProvider>,
    limits: ImportLimits,
    ai_timeout: Duration,
}

impl DocumentExtractor {
    pub fn new(provider: Arc<dyn TextProvider>, limits: ImportLimits, ai_timeout: Duration) -> Self {
        Self {
            provider,
            limits,
            ai_timeout,
        }
    }

    /// Extract line items. `property_names` is prompt context only.
    #[instrument(
        skip(self, document, property_names),
        fields(file_name = %document.file_name, bytes = document.data.len())
    )]
    pub async fn extract(
        &self,
        document: &UploadedDocument,
        property_names: &[String],
    ) -> Result<Extraction, ImportError> {
        if document.data.len() > self.limits.max_bytes {
            return Err(ImportError::Validation(format!(
                "'{}' is {} bytes; the limit is {} bytes",
                document.file_name,
                document.data.len(),
                self.limits.max_bytes
            )));
        }
        if document.data.is_empty() {
            return Err(ImportError::Validation(format!(
                "'{}' is empty",
                document.file_name
            )));
        }

        let kind = DocumentKind::detect(document.content_type.as_deref(), &document.file_name)?;

        let (items, row_errors) = match kind {
            DocumentKind::Csv => {
                let rows = read_csv_rows(&document.data)?;
                self.parse_sheet(&document.file_name, rows)?
            }
            DocumentKind::Workbook => {
                let rows = read_workbook_rows(&document.data)?;
                self.parse_sheet(&document.file_name, rows)?
            }
            DocumentKind::Pdf => self.extract_pdf(document, property_names).await?,
        };

        if !row_errors.is_empty() {
            tracing::warn!(
                file_name = %document.file_name,
                skipped = row_errors.len(),
                "Some rows could not be read"
            );
        }

        if items.is_empty() {
            record_import_stage("extract", "empty");
            return Err(ImportError::NoExpensesFound(format!(
                "No expenses found in '{}'",
                document.file_name
            )));
        }

        record_import_stage("extract", "success");
        tracing::info!(
            kind = kind.as_str(),
            items = items.len(),
            row_errors = row_errors.len(),
            "Document extracted"
        );

        Ok(Extraction {
            kind,
            items,
            row_errors,
        })
    }

    fn parse_sheet(
        &self,
        file_name: &str,
        rows: Vec<(usize, Vec<String>)>,
    ) -> Result<(Vec<ExtractedLineItem>, Vec<RowError>), ImportError> {
        let mut rows = rows
            .into_iter()
            .filter(|(_, cells)| cells.iter().any(|c| !c.trim().is_empty()));

        let Some((_, header)) = rows.next() else {
            return Err(ImportError::NoExpensesFound(format!(
                "'{}' has no header row",
                file_name
            )));
        };
        let columns = ColumnMap::from_header(&header)?;

        let data_rows: Vec<(usize, Vec<String>)> = rows.collect();
        if data_rows.len() > self.limits.max_rows {
            return Err(ImportError::Validation(format!(
                "'{}' has {} rows; the limit is {} rows",
                file_name,
                data_rows.len(),
                self.limits.max_rows
            )));
        }

        let mut items = Vec::with_capacity(data_rows.len());
        let mut row_errors = Vec::new();
        for (row, cells) in data_rows {
            match columns.parse_row(row, &cells) {
                Ok(item) => items.push(item),
                Err(message) => row_errors.push(RowError { row, message }),
            }
        }

        Ok((items, row_errors))
    }

    async fn extract_pdf(
        &self,
        document: &UploadedDocument,
        property_names: &[String],
    ) -> Result<(Vec<ExtractedLineItem>, Vec<RowError>), ImportError> {
        let prompt = pdf_prompt(property_names);
        let attachment = DocumentContext {
            file_name: document.file_name.clone(),
            mime_type: "application/pdf".to_string(),
            data: document.data.clone(),
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(
            self.ai_timeout,
            self.provider.generate(
                &prompt,
                std::slice::from_ref(&attachment),
                &GenerationParams::structured(),
            ),
        )
        .await;
        let elapsed = start.elapsed().as_secs_f64();

        let response = match outcome {
            Err(_) => {
                record_ai_call("extract", "timeout", elapsed);
                return Err(ImportError::AiServiceUnavailable(format!(
                    "document extraction timed out after {}s",
                    self.ai_timeout.as_secs()
                )));
            }
            Ok(Err(ProviderError::ContentFiltered)) => {
                record_ai_call("extract", "filtered", elapsed);
                return Err(ImportError::NoExpensesFound(format!(
                    "'{}' could not be read by the document service",
                    document.file_name
                )));
            }
            Ok(Err(e)) => {
                record_ai_call("extract", "error", elapsed);
                return Err(ImportError::AiServiceUnavailable(e.to_string()));
            }
            Ok(Ok(response)) => {
                record_ai_call("extract", "success", elapsed);
                response
            }
        };

        tracing::debug!(
            provider = self.provider.name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "PDF extraction reply received"
        );

        Ok(parse_pdf_reply(response.text.as_deref().unwrap_or_default()))
    }
}

// =============================================================================
// Spreadsheets
// =============================================================================

fn read_csv_rows(data: &[u8]) -> Result<Vec<(usize, Vec<String>)>, ImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data);

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record
            .map_err(|e| ImportError::Validation(format!("Could not read CSV: {}", e)))?;
        let row = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(index + 1);
        rows.push((row, record.iter().map(str::to_string).collect()));
    }
    Ok(rows)
}

fn read_workbook_rows(data: &[u8]) -> Result<Vec<(usize, Vec<String>)>, ImportError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(data.to_vec()))
        .map_err(|e| ImportError::Validation(format!("Could not open spreadsheet: {}", e)))?;

    let first_sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| ImportError::Validation("Spreadsheet has no worksheets".to_string()))?;

    let range = workbook
        .worksheet_range(&first_sheet)
        .map_err(|e| ImportError::Validation(format!("Could not read worksheet: {}", e)))?;

    let first_row = range.start().map(|(row, _)| row as usize).unwrap_or(0);
    Ok(range
        .rows()
        .enumerate()
        .map(|(index, cells)| {
            (
                first_row + index + 1,
                cells.iter().map(cell_text).collect(),
            )
        })
        .collect())
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::DateTime(_) | Data::DateTimeIso(_) => cell
            .as_date()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| cell.to_string()),
        Data::Empty => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

struct ColumnMap {
    property: usize,
    date: usize,
    description: usize,
    vendor: usize,
    amount: usize,
}

impl ColumnMap {
    fn from_header(header: &[String]) -> Result<Self, ImportError> {
        let lowered: Vec<String> = header.iter().map(|h| h.trim().to_lowercase()).collect();
        let find = |needle: &str| lowered.iter().position(|h| h.contains(needle));

        let positions: Vec<Option<usize>> = REQUIRED_COLUMNS.iter().map(|c| find(c)).collect();
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .zip(&positions)
            .filter(|(_, p)| p.is_none())
            .map(|(name, _)| *name)
            .collect();

        match positions.as_slice() {
            [Some(property), Some(date), Some(description), Some(vendor), Some(amount)] => {
                Ok(Self {
                    property: *property,
                    date: *date,
                    description: *description,
                    vendor: *vendor,
                    amount: *amount,
                })
            }
            _ => Err(ImportError::Validation(format!(
                "Spreadsheet is missing required column(s): {}",
                missing.join(", ")
            ))),
        }
    }

    fn parse_row(&self, row: usize, cells: &[String]) -> Result<ExtractedLineItem, String> {
        let cell = |index: usize| cells.get(index).map(|c| c.trim()).unwrap_or_default();

        let raw_property = cell(self.property);
        if raw_property.is_empty() {
            return Err("property is empty".to_string());
        }

        let amount = parse_amount(cell(self.amount)).map_err(|e| e.to_string())?;
        let date = parse_date(cell(self.date))?;

        let item = ExtractedLineItem {
            raw_property: raw_property.to_string(),
            date,
            amount,
            vendor: non_empty(cell(self.vendor)),
            description: non_empty(cell(self.description)),
            source_row: Some(row),
        };
        item.validate().map_err(|e| e.to_string())?;
        Ok(item)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Parse a date cell; an empty cell is "no date".
pub fn parse_date(raw: &str) -> Result<Option<NaiveDate>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    // Timestamps keep only their date part.
    let value = raw
        .split(|c: char| c == 'T' || c.is_whitespace())
        .next()
        .unwrap_or(raw);

    if value.contains('/') {
        let two_digit_year = value.rsplit('/').next().is_some_and(|y| y.len() == 2);
        let format = if two_digit_year { "%m/%d/%y" } else { "%m/%d/%Y" };
        return NaiveDate::parse_from_str(value, format)
            .map(Some)
            .map_err(|_| format!("date '{}' is not a valid date", raw));
    }

    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
        .map(Some)
        .ok_or_else(|| format!("date '{}' is not a valid date", raw))
}

// =============================================================================
// PDFs
// =============================================================================

fn pdf_prompt(property_names: &[String]) -> String {
    let mut names: Vec<&str> = property_names.iter().map(String::as_str).collect();
    names.sort_unstable();
    names.dedup();

    format!(
        "Extract every itemized charge from the attached vendor invoice.\n\
         Known property names for context (a charge may name a property differently): {}\n\
         Respond with JSON only, no prose, exactly in this shape:\n\
         {{\"expenses\":[{{\"property\":\"<property name or address as written>\",\
         \"date\":\"YYYY-MM-DD or null\",\"amount\":\"<amount as written>\",\
         \"description\":\"<line description or null>\",\"vendor\":\"<vendor or null>\"}}]}}\n\
         Use a negative amount for credits. If there are no charges, return {{\"expenses\":[]}}.",
        if names.is_empty() {
            "(none)".to_string()
        } else {
            names.join("; ")
        }
    )
}

#[derive(Debug, Deserialize)]
struct PdfReply {
    #[serde(default)]
    expenses: Vec<PdfExpense>,
}

#[derive(Debug, Deserialize)]
struct PdfExpense {
    #[serde(default)]
    property: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    amount: Value,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
}

/// Best-effort read of the model reply. Anything unparseable yields no items.
fn parse_pdf_reply(text: &str) -> (Vec<ExtractedLineItem>, Vec<RowError>) {
    let Some(span) = first_balanced_object(text) else {
        tracing::warn!("PDF extraction reply contained no JSON object");
        return (Vec::new(), Vec::new());
    };
    let reply: PdfReply = match serde_json::from_str(span) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(error = %e, "PDF extraction reply was not valid JSON");
            return (Vec::new(), Vec::new());
        }
    };

    let mut items = Vec::with_capacity(reply.expenses.len());
    let mut row_errors = Vec::new();
    for (index, expense) in reply.expenses.into_iter().enumerate() {
        let row = index + 1;
        match pdf_line_item(expense) {
            Ok(item) => items.push(item),
            Err(message) => row_errors.push(RowError { row, message }),
        }
    }
    (items, row_errors)
}

fn pdf_line_item(expense: PdfExpense) -> Result<ExtractedLineItem, String> {
    let raw_property = expense
        .property
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| "property is empty".to_string())?
        .to_string();

    let amount = match &expense.amount {
        Value::Number(n) => parse_amount(&n.to_string()),
        Value::String(s) => parse_amount(s),
        _ => return Err("amount is missing".to_string()),
    }
    .map_err(|e| e.to_string())?;

    let date = parse_date(expense.date.as_deref().unwrap_or_default())?;

    let item = ExtractedLineItem {
        raw_property,
        date,
        amount,
        vendor: expense.vendor.as_deref().and_then(non_empty),
        description: expense.description.as_deref().and_then(non_empty),
        source_row: None,
    };
    item.validate().map_err(|e| e.to_string())?;
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::MockTextProvider;
    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn extractor(provider: MockTextProvider) -> DocumentExtractor {
        DocumentExtractor::new(
            Arc::new(provider),
            ImportLimits::default(),
            Duration::from_millis(200),
        )
    }

    fn csv(name: &str, body: &str) -> UploadedDocument {
        UploadedDocument {
            file_name: name.to_string(),
            content_type: Some("text/csv".to_string()),
            data: body.as_bytes().to_vec(),
        }
    }

    fn pdf() -> UploadedDocument {
        UploadedDocument {
            file_name: "invoice.pdf".to_string(),
            content_type: Some("application/pdf".to_string()),
            data: b"%PDF-1.4".to_vec(),
        }
    }

    #[test]
    fn detects_kind_from_extension_then_content_type() {
        assert_eq!(DocumentKind::detect(None, "May.PDF").unwrap(), DocumentKind::Pdf);
        assert_eq!(
            DocumentKind::detect(Some("application/octet-stream"), "may.xlsx").unwrap(),
            DocumentKind::Workbook
        );
        assert_eq!(
            DocumentKind::detect(Some("text/csv; charset=utf-8"), "upload").unwrap(),
            DocumentKind::Csv
        );
        assert!(matches!(
            DocumentKind::detect(Some("image/png"), "scan.png"),
            Err(ImportError::Validation(_))
        ));
    }

    #[test]
    fn dates_accept_documented_formats() {
        let may_3 = NaiveDate::from_ymd_opt(2024, 5, 3);
        assert_eq!(parse_date("2024-05-03").unwrap(), may_3);
        assert_eq!(parse_date("05/03/2024").unwrap(), may_3);
        assert_eq!(parse_date("05/03/24").unwrap(), may_3);
        assert_eq!(parse_date("03-May-2024").unwrap(), may_3);
        assert_eq!(parse_date("2024-05-03T00:00:00").unwrap(), may_3);
        assert_eq!(parse_date("").unwrap(), None);
        assert!(parse_date("someday").is_err());
    }

    #[tokio::test]
    async fn csv_rows_are_extracted_with_row_errors() {
        let body = "Property Name,Service Date,Description,Vendor,Amount ($)\n\
                    Sunset Villa,2024-05-03,Pool cleaning,Acme,\"$1,234.56\"\n\
                    \n\
                    Unknown Ave,,Gutter repair,,(50.00)\n\
                    ,2024-05-04,Orphan,Acme,10\n\
                    Sunset Villa,2024-05-05,Broken,Acme,12.34.56\n";
        let extraction = extractor(MockTextProvider::new(false))
            .extract(&csv("may.csv", body), &[])
            .await
            .unwrap();

        assert_eq!(extraction.kind, DocumentKind::Csv);
        assert_eq!(extraction.items.len(), 2);

        let first = &extraction.items[0];
        assert_eq!(first.raw_property, "Sunset Villa");
        assert_eq!(first.amount, dec("1234.56"));
        assert_eq!(first.vendor.as_deref(), Some("Acme"));
        assert_eq!(first.source_row, Some(2));

        let second = &extraction.items[1];
        assert_eq!(second.amount, dec("-50.00"));
        assert_eq!(second.date, None);
        assert_eq!(second.vendor, None);
        assert_eq!(second.source_row, Some(4));

        let rows: Vec<usize> = extraction.row_errors.iter().map(|e| e.row).collect();
        assert_eq!(rows, vec![5, 6]);
        assert!(extraction.row_errors[1].message.contains("decimal point"));
    }

    #[tokio::test]
    async fn missing_columns_are_named() {
        let err = extractor(MockTextProvider::new(false))
            .extract(&csv("bad.csv", "Property,Amount\nA,1\n"), &[])
            .await
            .unwrap_err();
        match err {
            ImportError::Validation(msg) => {
                assert!(msg.contains("date, description, vendor"), "{}", msg)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn zero_valid_rows_is_no_expenses_found() {
        let body = "property,date,description,vendor,amount\n,2024-05-01,x,y,abc\n";
        let err = extractor(MockTextProvider::new(false))
            .extract(&csv("empty.csv", body), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::NoExpensesFound(_)));
    }

    #[tokio::test]
    async fn limits_are_enforced_before_parsing() {
        let limited = DocumentExtractor::new(
            Arc::new(MockTextProvider::new(false)),
            ImportLimits {
                max_rows: 2,
                max_bytes: 1024,
                ..ImportLimits::default()
            },
            Duration::from_secs(1),
        );

        let mut body = String::from("property,date,description,vendor,amount\n");
        for _ in 0..3 {
            body.push_str("A,2024-05-01,x,y,1\n");
        }
        let err = limited.extract(&csv("rows.csv", &body), &[]).await.unwrap_err();
        assert!(matches!(err, ImportError::Validation(ref m) if m.contains("limit is 2 rows")));

        let big = "x".repeat(2048);
        let err = limited.extract(&csv("big.csv", &big), &[]).await.unwrap_err();
        assert!(matches!(err, ImportError::Validation(ref m) if m.contains("bytes")));
    }

    #[tokio::test]
    async fn pdf_reply_is_scanned_for_json() {
        let provider = MockTextProvider::new(true);
        provider.push_reply(
            "Here is the data:\n```json\n{\"expenses\":[\
             {\"property\":\"Sunset Villa\",\"date\":\"2024-05-03\",\"amount\":\"$120.00\",\"description\":\"Pool\"},\
             {\"property\":\"Oak Court\",\"date\":null,\"amount\":45.5},\
             {\"property\":\"\",\"amount\":\"1\"}]}\n```",
        );
        let extraction = extractor(provider)
            .extract(&pdf(), &["Sunset Villa".to_string()])
            .await
            .unwrap();

        assert_eq!(extraction.items.len(), 2);
        assert_eq!(extraction.items[0].amount, dec("120.00"));
        assert_eq!(extraction.items[1].amount, dec("45.5"));
        assert_eq!(extraction.items[1].date, None);
        assert_eq!(extraction.row_errors.len(), 1);
        assert_eq!(extraction.row_errors[0].row, 3);
    }

    #[tokio::test]
    async fn pdf_prompt_lists_known_properties() {
        let provider = Arc::new(MockTextProvider::new(true));
        provider.push_reply("{\"expenses\":[{\"property\":\"A\",\"amount\":1}]}");
        let extractor = DocumentExtractor::new(
            provider.clone(),
            ImportLimits::default(),
            Duration::from_secs(1),
        );
        extractor
            .extract(&pdf(), &["Oak Court".to_string(), "Sunset Villa".to_string()])
            .await
            .unwrap();
        let prompts = provider.prompts();
        assert!(prompts[0].contains("Oak Court; Sunset Villa"));
    }

    #[tokio::test]
    async fn invalid_pdf_reply_is_no_expenses_found() {
        let provider = MockTextProvider::new(true);
        provider.push_reply("I could not find any charges.");
        let err = extractor(provider).extract(&pdf(), &[]).await.unwrap_err();
        assert!(matches!(err, ImportError::NoExpensesFound(_)));
    }

    #[tokio::test]
    async fn pdf_timeout_is_ai_unavailable() {
        let provider = MockTextProvider::new(true).with_delay(Duration::from_secs(5));
        let err = extractor(provider).extract(&pdf(), &[]).await.unwrap_err();
        assert!(matches!(err, ImportError::AiServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn unconfigured_provider_is_ai_unavailable() {
        let err = extractor(MockTextProvider::new(false))
            .extract(&pdf(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::AiServiceUnavailable(_)));
    }
}
