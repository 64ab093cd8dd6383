//! Stage composition - the work units that make up each pipeline stage

use crate::core::{
    config::EngineConfig, Attachment, AuditFindings, AuditReport, FactModel, GeneratedImage,
    ImagePayload, PageSpec, PipelineContext, Severity, SourceFile, Stage,
};
use crate::execution::runner::{TaskError, TaskLogger, UnitJob, WorkUnit};
use crate::generator::{generate_typed, AspectRatio, ContentGenerator, QualityTier};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub const EXPAND_REQUIREMENTS: &str = "Expand requirements";
pub const EXTRACT_FACT_MODEL: &str = "Extract fact model";
pub const PLAN_PAGES: &str = "Plan pages";
pub const RENDER_VISUALS: &str = "Render visuals";
pub const WRITE_DOCUMENTS: &str = "Write documents";
pub const GENERATE_SOURCE: &str = "Generate source";
pub const AUDIT_ARTIFACTS: &str = "Audit artifacts";

/// Build the work units for a stage, in execution order
///
/// The human-input stage has no units: it completes through
/// `submit_human_input`.
pub fn compose(
    stage: Stage,
    generator: &Arc<dyn ContentGenerator>,
    config: &EngineConfig,
) -> Vec<WorkUnit> {
    let policy = config.retry.for_stage(stage);
    let generator = generator.clone();

    let units = match stage {
        Stage::Analysis => {
            let tier = config.quality.analysis;
            vec![
                WorkUnit::new(
                    EXPAND_REQUIREMENTS,
                    "Product Analyst",
                    ExpandRequirements {
                        generator: generator.clone(),
                        tier,
                    },
                ),
                WorkUnit::new(
                    EXTRACT_FACT_MODEL,
                    "Domain Modeler",
                    ExtractFactModel {
                        generator: generator.clone(),
                        tier,
                    },
                ),
                WorkUnit::new(PLAN_PAGES, "UX Designer", PlanPages { generator, tier }),
            ]
        }
        Stage::HumanInput => Vec::new(),
        Stage::Visuals => vec![WorkUnit::new(
            RENDER_VISUALS,
            "Visual Designer",
            RenderVisuals {
                generator,
                aspect_ratio: config.image_aspect_ratio,
            },
        )],
        Stage::Documents => vec![WorkUnit::new(
            WRITE_DOCUMENTS,
            "Technical Writer",
            WriteDocuments {
                generator,
                tier: config.quality.documents,
                documents: config.documents.clone(),
            },
        )],
        Stage::Source => vec![WorkUnit::new(
            GENERATE_SOURCE,
            "Software Engineer",
            GenerateSource {
                generator,
                tier: config.quality.source,
            },
        )],
        Stage::Audit => vec![WorkUnit::new(
            AUDIT_ARTIFACTS,
            "Compliance Auditor",
            AuditArtifacts {
                generator,
                tier: config.quality.audit,
            },
        )],
    };

    units.into_iter().map(|u| u.with_retry(policy)).collect()
}

fn require_fact_model(ctx: &PipelineContext) -> Result<&FactModel, TaskError> {
    ctx.fact_model
        .as_ref()
        .ok_or_else(|| TaskError::MissingInput("fact model".to_string()))
}

/// Lowercase, dash-separated form of a page id for filenames
fn slug(text: &str) -> String {
    let mut out = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "page".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn image_file_name(page: &PageSpec) -> String {
    format!("{}.png", slug(&page.id))
}

/// Short description of the fact model for prompts
fn describe_fact_model(model: &FactModel) -> String {
    let modules: Vec<String> = model
        .modules
        .iter()
        .map(|m| format!("- {}: {}", m.name, m.description))
        .collect();
    format!(
        "Software: {} (version {})\nSummary: {}\nModules:\n{}\nTech stack: {}",
        model.software_name,
        model.version,
        model.summary,
        modules.join("\n"),
        model.tech_stack.join(", ")
    )
}

struct ExpandRequirements {
    generator: Arc<dyn ContentGenerator>,
    tier: QualityTier,
}

#[async_trait]
impl UnitJob for ExpandRequirements {
    async fn run(&self, ctx: &mut PipelineContext, log: &dyn TaskLogger) -> Result<(), TaskError> {
        if ctx.raw_input.trim().is_empty() {
            return Err(TaskError::MissingInput("raw input text".to_string()));
        }

        let prompt = format!(
            "Expand the following notes into a complete software requirements \
             description. Cover purpose, users, features and constraints.\n\n{}",
            ctx.raw_input
        );
        let text = self.generator.generate_text(&prompt, self.tier).await?;
        log.log(
            &format!("Expanded input into {} characters of requirements", text.len()),
            Severity::Info,
        );
        ctx.requirements = Some(text);
        Ok(())
    }
}

struct ExtractFactModel {
    generator: Arc<dyn ContentGenerator>,
    tier: QualityTier,
}

#[async_trait]
impl UnitJob for ExtractFactModel {
    async fn run(&self, ctx: &mut PipelineContext, log: &dyn TaskLogger) -> Result<(), TaskError> {
        let requirements = ctx
            .requirements
            .as_deref()
            .ok_or_else(|| TaskError::MissingInput("expanded requirements".to_string()))?;

        let schema = json!({
            "type": "object",
            "required": ["software_name", "version", "summary", "modules", "tech_stack"],
            "properties": {
                "software_name": { "type": "string" },
                "short_name": { "type": "string" },
                "version": { "type": "string" },
                "summary": { "type": "string" },
                "modules": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name", "description"],
                        "properties": {
                            "name": { "type": "string" },
                            "description": { "type": "string" }
                        }
                    }
                },
                "tech_stack": { "type": "array", "items": { "type": "string" } }
            }
        });
        let prompt = format!(
            "Extract the structured fact model of the software described below.\n\n{}",
            requirements
        );

        let model: FactModel =
            generate_typed(self.generator.as_ref(), &prompt, &schema, self.tier).await?;
        if model.software_name.trim().is_empty() {
            return Err(TaskError::Failed("fact model has no software name".to_string()));
        }

        log.log(
            &format!(
                "Fact model for {} with {} module(s)",
                model.software_name,
                model.modules.len()
            ),
            Severity::Info,
        );
        ctx.fact_model = Some(model);
        Ok(())
    }
}

#[derive(Deserialize)]
struct PagePlan {
    pages: Vec<PageSpec>,
}

struct PlanPages {
    generator: Arc<dyn ContentGenerator>,
    tier: QualityTier,
}

#[async_trait]
impl UnitJob for PlanPages {
    async fn run(&self, ctx: &mut PipelineContext, log: &dyn TaskLogger) -> Result<(), TaskError> {
        let model = require_fact_model(ctx)?;

        let schema = json!({
            "type": "object",
            "required": ["pages"],
            "properties": {
                "pages": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["id", "title", "purpose"],
                        "properties": {
                            "id": { "type": "string" },
                            "title": { "type": "string" },
                            "purpose": { "type": "string" },
                            "elements": { "type": "array", "items": { "type": "string" } }
                        }
                    }
                }
            }
        });
        let prompt = format!(
            "List the screens of this software. Give each a stable id, a title, \
             its purpose and the visible elements.\n\n{}",
            describe_fact_model(model)
        );

        let plan: PagePlan =
            generate_typed(self.generator.as_ref(), &prompt, &schema, self.tier).await?;
        if plan.pages.is_empty() {
            return Err(TaskError::Failed("page plan is empty".to_string()));
        }

        log.log(&format!("Planned {} page(s)", plan.pages.len()), Severity::Info);
        ctx.pages = plan.pages;
        Ok(())
    }
}

struct RenderVisuals {
    generator: Arc<dyn ContentGenerator>,
    aspect_ratio: AspectRatio,
}

#[async_trait]
impl UnitJob for RenderVisuals {
    async fn run(&self, ctx: &mut PipelineContext, log: &dyn TaskLogger) -> Result<(), TaskError> {
        if ctx.pages.is_empty() {
            return Err(TaskError::MissingInput("page specifications".to_string()));
        }
        let software = require_fact_model(ctx)?.software_name.clone();

        for page in ctx.pages.clone() {
            let file_name = image_file_name(&page);
            if ctx.artifacts.images.contains_key(&file_name) {
                log.log(&format!("{} already rendered", file_name), Severity::Info);
                continue;
            }

            let prompt = format!(
                "A clean, realistic application screenshot of the \"{}\" screen of {}. \
                 Purpose: {}. Visible elements: {}.",
                page.title,
                software,
                page.purpose,
                page.elements.join(", ")
            );
            let bytes = self
                .generator
                .generate_image(&prompt, self.aspect_ratio)
                .await?
                .ok_or_else(|| {
                    TaskError::Failed(format!("no image returned for page {}", page.id))
                })?;

            ctx.add_image(GeneratedImage {
                file_name: file_name.clone(),
                page_id: page.id.clone(),
                mime_type: "image/png".to_string(),
                payload: ImagePayload::inline(bytes),
            });
            log.log_with_attachment(
                &format!("Rendered {}", page.title),
                Severity::Info,
                Attachment::Image { file_name },
            );
        }

        Ok(())
    }
}

struct WriteDocuments {
    generator: Arc<dyn ContentGenerator>,
    tier: QualityTier,
    documents: Vec<String>,
}

#[async_trait]
impl UnitJob for WriteDocuments {
    async fn run(&self, ctx: &mut PipelineContext, log: &dyn TaskLogger) -> Result<(), TaskError> {
        let facts = describe_fact_model(require_fact_model(ctx)?);
        let registration = ctx
            .registration
            .as_ref()
            .ok_or_else(|| TaskError::MissingInput("registration details".to_string()))?;
        let environment = format!(
            "Owner: {}\nCompleted: {}\nDevelopment hardware: {}\nDevelopment OS: {}\n\
             Development tools: {}\nRuntime environment: {}\nLanguage: {}",
            registration.owner,
            registration.completion_date,
            registration.dev_hardware,
            registration.dev_os,
            registration.dev_tools,
            registration.runtime_environment,
            registration.language
        );
        let pages: Vec<String> = ctx
            .pages
            .iter()
            .map(|p| format!("- {} ({}): {}", p.title, image_file_name(p), p.purpose))
            .collect();

        for name in &self.documents {
            let prompt = format!(
                "Write the document \"{}\" in markdown for the software below. \
                 Reference screenshots by filename where relevant.\n\n{}\n\n{}\n\nScreens:\n{}",
                name,
                facts,
                environment,
                pages.join("\n")
            );
            let text = self.generator.generate_text(&prompt, self.tier).await?;
            log.log(&format!("Wrote {} ({} characters)", name, text.len()), Severity::Info);
            ctx.artifacts.documents.insert(name.clone(), text);
        }

        Ok(())
    }
}

#[derive(Deserialize)]
struct SourceBundle {
    files: Vec<SourceFile>,
}

struct GenerateSource {
    generator: Arc<dyn ContentGenerator>,
    tier: QualityTier,
}

#[async_trait]
impl UnitJob for GenerateSource {
    async fn run(&self, ctx: &mut PipelineContext, log: &dyn TaskLogger) -> Result<(), TaskError> {
        let facts = describe_fact_model(require_fact_model(ctx)?);
        let language = ctx
            .registration
            .as_ref()
            .map(|r| r.language.clone())
            .unwrap_or_else(|| "the primary language of the tech stack".to_string());

        let schema = json!({
            "type": "object",
            "required": ["files"],
            "properties": {
                "files": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["path", "language", "content"],
                        "properties": {
                            "path": { "type": "string" },
                            "language": { "type": "string" },
                            "content": { "type": "string" }
                        }
                    }
                }
            }
        });
        let prompt = format!(
            "Produce a plausible source tree written in {} that implements every \
             module of the software below.\n\n{}",
            language, facts
        );

        let bundle: SourceBundle =
            generate_typed(self.generator.as_ref(), &prompt, &schema, self.tier).await?;
        if bundle.files.is_empty() {
            return Err(TaskError::Failed("source bundle is empty".to_string()));
        }

        ctx.artifacts.source_tree = bundle.files;
        log.log(
            &format!(
                "Generated {} file(s), {} line(s)",
                ctx.artifacts.source_tree.len(),
                ctx.source_line_count()
            ),
            Severity::Info,
        );
        Ok(())
    }
}

struct AuditArtifacts {
    generator: Arc<dyn ContentGenerator>,
    tier: QualityTier,
}

#[async_trait]
impl UnitJob for AuditArtifacts {
    async fn run(&self, ctx: &mut PipelineContext, log: &dyn TaskLogger) -> Result<(), TaskError> {
        let facts = describe_fact_model(require_fact_model(ctx)?);
        let documents: Vec<String> = ctx
            .artifacts
            .documents
            .iter()
            .map(|(name, body)| format!("## {}\n{}", name, body))
            .collect();
        let images: Vec<&String> = ctx.artifacts.images.keys().collect();
        let files: Vec<&str> = ctx
            .artifacts
            .source_tree
            .iter()
            .map(|f| f.path.as_str())
            .collect();

        let schema = json!({
            "type": "object",
            "required": ["passed", "issues"],
            "properties": {
                "passed": { "type": "boolean" },
                "score": { "type": "integer", "minimum": 0, "maximum": 100 },
                "issues": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["severity", "message"],
                        "properties": {
                            "severity": { "enum": ["minor", "major", "critical"] },
                            "message": { "type": "string" },
                            "artifact": { "type": "string" }
                        }
                    }
                }
            }
        });
        let prompt = format!(
            "Audit the artifact bundle for consistency with the fact model: names, \
             versions, features and screenshots must agree across documents.\n\n\
             {}\n\nImages: {}\nSource files: {}\n\n{}",
            facts,
            images.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
            files.join(", "),
            documents.join("\n\n")
        );

        let findings: AuditFindings =
            generate_typed(self.generator.as_ref(), &prompt, &schema, self.tier).await?;
        let report = AuditReport::from_findings(findings);

        if report.passed {
            log.log("Audit passed", Severity::Success);
        } else {
            log.log(
                &format!("Audit found {} unresolved issue(s)", report.issues.len()),
                Severity::Warning,
            );
        }
        ctx.artifacts.audit_history.push(report);
        Ok(())
    }
}
