//! Column resolution: labels into cells, and derived age categories.

use crate::dataset::{AnalysisColumn, CellValue};
use crate::error::AnalysisError;
use engagement_config::{AgeCategoryConfiguration, AnalysisDatasetConfiguration};
use engagement_store::EngagementMessage;
use engagement_vocab::{CodeScheme, ControlCode, VocabularyRegistry};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct ResolvedColumn {
    column: AnalysisColumn,
    scheme: Arc<CodeScheme>,
    /// Source column index and buckets for derived age columns
    age: Option<(usize, AgeCategoryConfiguration)>,
}

/// Columns of one analysis dataset, bound to their schemes.
#[derive(Debug)]
pub struct ColumnSet {
    columns: Vec<ResolvedColumn>,
}

impl ColumnSet {
    pub fn resolve(
        config: &AnalysisDatasetConfiguration,
        registry: &VocabularyRegistry,
    ) -> Result<Self, AnalysisError> {
        let mut columns: Vec<ResolvedColumn> = Vec::with_capacity(config.coding_configs.len());
        for coding in &config.coding_configs {
            let scheme = registry
                .get(&coding.code_scheme)
                .cloned()
                .ok_or_else(|| AnalysisError::UnknownScheme(coding.code_scheme.clone()))?;

            let age = match &coding.age_category_config {
                Some(age) => {
                    let source = columns
                        .iter()
                        .position(|c| c.column.name == age.age_analysis_dataset)
                        .ok_or_else(|| AnalysisError::MissingAgeSource {
                            column: coding.analysis_dataset.clone(),
                            source_column: age.age_analysis_dataset.clone(),
                        })?;
                    Some((source, age.clone()))
                }
                None => None,
            };

            columns.push(ResolvedColumn {
                column: AnalysisColumn {
                    name: coding.analysis_dataset.clone(),
                    scheme_id: coding.code_scheme.clone(),
                    location: coding.analysis_location,
                    derived: coding.is_derived(),
                },
                scheme,
                age,
            });
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> Vec<AnalysisColumn> {
        self.columns.iter().map(|c| c.column.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Whether the message has a checked effective label on any read column.
    pub fn is_coded(&self, message: &EngagementMessage) -> bool {
        self.columns
            .iter()
            .filter(|c| !c.column.derived)
            .any(|c| message.has_checked_label(&c.column.scheme_id))
    }

    /// Checked effective labels of `message` for column `idx`, by slot.
    ///
    /// Empty for derived columns or when nothing is checked.
    pub fn checked_cells(&self, idx: usize, message: &EngagementMessage) -> Vec<CellValue> {
        let Some(resolved) = self.columns.get(idx) else {
            return Vec::new();
        };
        if resolved.column.derived {
            return Vec::new();
        }

        message
            .effective_labels(&resolved.column.scheme_id)
            .into_iter()
            .filter(|label| label.checked)
            .filter_map(|label| match resolved.scheme.code(&label.code_id) {
                Some(code) => Some(CellValue::from_code(code)),
                None => {
                    debug!(
                        key = message.message_key.short(),
                        scheme = %resolved.column.scheme_id,
                        code = %label.code_id,
                        "Label code no longer in scheme; ignored"
                    );
                    None
                }
            })
            .collect()
    }

    /// Fill empty read columns with NOT_REVIEWED and compute derived columns.
    ///
    /// Returns the number of NOT_REVIEWED cells written. Columns past the end
    /// of `cells` are left alone.
    pub fn complete(&self, cells: &mut [Vec<CellValue>]) -> usize {
        let mut not_reviewed = 0;
        for (idx, resolved) in self.columns.iter().enumerate().take(cells.len()) {
            if let Some((source, age)) = &resolved.age {
                let value = categorize_age(
                    cells.get(*source).and_then(|c| c.first()),
                    age,
                    &resolved.scheme,
                );
                cells[idx] = vec![value];
            } else if cells[idx].is_empty() {
                cells[idx] = vec![CellValue::control(&resolved.scheme, ControlCode::NotReviewed)];
                not_reviewed += 1;
            }
        }
        not_reviewed
    }

    /// One cell per column for a participant's mobile operator.
    ///
    /// The operator is matched against each scheme's match values, then its
    /// string values. Unknown or missing operators are NOT_CODED.
    pub fn operator_cells(&self, operator: Option<&str>) -> Vec<Vec<CellValue>> {
        self.columns
            .iter()
            .map(|resolved| {
                let scheme = &resolved.scheme;
                let cell = operator
                    .and_then(|op| {
                        scheme
                            .code_for_match_value(op)
                            .or_else(|| scheme.code_for_string_value(op))
                    })
                    .map(CellValue::from_code)
                    .unwrap_or_else(|| CellValue::control(scheme, ControlCode::NotCoded));
                vec![cell]
            })
            .collect()
    }
}

/// Map an age cell onto the first bucket containing it.
///
/// A control-coded source propagates its control code. A value outside every
/// bucket, or with no numeric value, becomes NOT_CODED.
pub fn categorize_age(
    source: Option<&CellValue>,
    config: &AgeCategoryConfiguration,
    scheme: &CodeScheme,
) -> CellValue {
    let Some(source) = source else {
        return CellValue::control(scheme, ControlCode::NotReviewed);
    };
    if let Some(control) = source.control_code {
        return CellValue::control(scheme, control);
    }

    let age = source
        .numeric_value
        .or_else(|| source.string_value.trim().parse().ok());
    let bucket = age.and_then(|age| config.categories.iter().find(|b| b.contains(age)));

    match bucket.and_then(|b| scheme.code_for_string_value(&b.label)) {
        Some(code) => CellValue::from_code(code),
        None => CellValue::control(scheme, ControlCode::NotCoded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engagement_config::{AgeCategory, AnalysisDatasetType, AnalysisLocation, CodingConfiguration};
    use engagement_ids::{CodeId, CodeSchemeId};
    use engagement_vocab::{Code, CodeType};

    fn code(id: &str, value: &str, control: Option<ControlCode>) -> Code {
        Code {
            code_id: CodeId::parse(id).unwrap(),
            display_text: value.to_string(),
            string_value: value.to_string(),
            numeric_value: value.parse().ok(),
            code_type: if control.is_some() {
                CodeType::Control
            } else {
                CodeType::Normal
            },
            control_code: control,
            match_values: Vec::new(),
        }
    }

    fn category_scheme() -> CodeScheme {
        let mut codes: Vec<Code> = ["10_to_14", "15_to_17", "18_to_35", "36_to_54", "55_to_99"]
            .iter()
            .map(|label| code(&format!("cat-{}", label), label, None))
            .collect();
        codes.push(code("cat-nc", "NC", Some(ControlCode::NotCoded)));
        codes.push(code("cat-stop", "STOP", Some(ControlCode::Stop)));
        CodeScheme::new(CodeSchemeId::parse("age_category").unwrap(), "age_category", "1", codes)
            .unwrap()
    }

    fn buckets() -> AgeCategoryConfiguration {
        let bucket = |low, high, label: &str| AgeCategory {
            low,
            high,
            label: label.to_string(),
        };
        AgeCategoryConfiguration {
            age_analysis_dataset: "age".to_string(),
            categories: vec![
                bucket(10, 14, "10_to_14"),
                bucket(15, 17, "15_to_17"),
                bucket(18, 35, "18_to_35"),
                bucket(36, 54, "36_to_54"),
                bucket(55, 99, "55_to_99"),
            ],
        }
    }

    fn age(value: i64) -> CellValue {
        CellValue {
            code_id: Some(CodeId::parse(&format!("age-{}", value)).unwrap()),
            string_value: value.to_string(),
            numeric_value: Some(value),
            control_code: None,
        }
    }

    fn column_set(
        schemes: Vec<CodeScheme>,
        dataset_type: AnalysisDatasetType,
        coding_configs: Vec<CodingConfiguration>,
    ) -> ColumnSet {
        let registry = VocabularyRegistry::from_schemes(schemes).unwrap();
        let config = AnalysisDatasetConfiguration {
            name: "test".to_string(),
            engagement_db_datasets: Vec::new(),
            dataset_type,
            raw_dataset: "test_raw".to_string(),
            coding_configs,
        };
        ColumnSet::resolve(&config, &registry).unwrap()
    }

    fn column(scheme: &str, age_category_config: Option<AgeCategoryConfiguration>) -> CodingConfiguration {
        CodingConfiguration {
            code_scheme: CodeSchemeId::parse(scheme).unwrap(),
            analysis_dataset: scheme.to_string(),
            age_category_config,
            analysis_location: None,
        }
    }

    fn categorize(source: CellValue) -> String {
        categorize_age(Some(&source), &buckets(), &category_scheme()).string_value
    }

    #[test]
    fn test_age_bucket_boundaries() {
        assert_eq!(categorize(age(14)), "10_to_14");
        assert_eq!(categorize(age(15)), "15_to_17");
        assert_eq!(categorize(age(36)), "36_to_54");
        assert_eq!(categorize(age(99)), "55_to_99");
    }

    #[test]
    fn test_age_outside_buckets_is_not_coded() {
        let scheme = category_scheme();
        let cell = categorize_age(Some(&age(100)), &buckets(), &scheme);
        assert_eq!(cell.control_code, Some(ControlCode::NotCoded));
        assert_eq!(cell.code_id.as_ref().map(|c| c.as_str()), Some("cat-nc"));
        assert_eq!(categorize(age(9)), "NC");
    }

    #[test]
    fn test_first_matching_bucket_wins() {
        let mut overlapping = buckets();
        overlapping.categories.insert(
            0,
            AgeCategory {
                low: 10,
                high: 20,
                label: "10_to_14".to_string(),
            },
        );
        let cell = categorize_age(Some(&age(16)), &overlapping, &category_scheme());
        assert_eq!(cell.string_value, "10_to_14");
    }

    #[test]
    fn test_control_source_propagates() {
        let scheme = category_scheme();
        let stop = CellValue {
            code_id: Some(CodeId::parse("age-stop").unwrap()),
            string_value: "STOP".to_string(),
            numeric_value: None,
            control_code: Some(ControlCode::Stop),
        };
        let cell = categorize_age(Some(&stop), &buckets(), &scheme);
        assert_eq!(cell.code_id.as_ref().map(|c| c.as_str()), Some("cat-stop"));

        let ws = CellValue {
            control_code: Some(ControlCode::WrongScheme),
            string_value: "WS".to_string(),
            ..stop
        };
        let cell = categorize_age(Some(&ws), &buckets(), &scheme);
        assert_eq!(cell.code_id, None);
        assert_eq!(cell.control_code, Some(ControlCode::WrongScheme));
    }

    fn age_columns() -> ColumnSet {
        column_set(
            vec![age_scheme(), category_scheme()],
            AnalysisDatasetType::Demographic,
            vec![column("age", None), column("age_category", Some(buckets()))],
        )
    }

    fn age_scheme() -> CodeScheme {
        let codes = vec![
            code("age-23", "23", None),
            code("age-nr", "NR", Some(ControlCode::NotReviewed)),
        ];
        CodeScheme::new(CodeSchemeId::parse("age").unwrap(), "age", "1", codes).unwrap()
    }

    #[test]
    fn test_complete_ignores_columns_beyond_short_row() {
        let columns = age_columns();
        assert_eq!(columns.len(), 2);

        let mut short = vec![Vec::new()];
        assert_eq!(columns.complete(&mut short), 1);
        assert_eq!(short[0][0].control_code, Some(ControlCode::NotReviewed));

        let mut empty: Vec<Vec<CellValue>> = Vec::new();
        assert_eq!(columns.complete(&mut empty), 0);
    }

    #[test]
    fn test_complete_derives_age_category() {
        let columns = age_columns();
        let mut cells = vec![vec![age(23)], Vec::new()];
        assert_eq!(columns.complete(&mut cells), 0);
        assert_eq!(cells[1][0].string_value, "18_to_35");
    }

    #[test]
    fn test_operator_cells_match_scheme_or_not_coded() {
        let mut hormud = code("op-hormud", "hormud", None);
        hormud.match_values = vec!["Hormud".to_string()];
        let scheme = CodeScheme::new(
            CodeSchemeId::parse("operator").unwrap(),
            "operator",
            "1",
            vec![
                hormud,
                code("op-other", "other", None),
                code("op-nc", "NC", Some(ControlCode::NotCoded)),
            ],
        )
        .unwrap();
        let mut operator = column("operator", None);
        operator.analysis_location = Some(AnalysisLocation::SomaliaOperator);
        let columns = column_set(vec![scheme], AnalysisDatasetType::Operator, vec![operator]);

        let id = |cells: Vec<Vec<CellValue>>| {
            cells[0][0].code_id.as_ref().map(|c| c.as_str().to_string())
        };
        assert_eq!(id(columns.operator_cells(Some("hormud"))).as_deref(), Some("op-hormud"));
        assert_eq!(id(columns.operator_cells(Some("other"))).as_deref(), Some("op-other"));
        assert_eq!(id(columns.operator_cells(Some("golis"))).as_deref(), Some("op-nc"));
        assert_eq!(id(columns.operator_cells(None)).as_deref(), Some("op-nc"));
    }
}
