//! Built-in scenario templates that steer AI test generation.
//!
//! A run may name a template by id, ask for `auto` to pick one from the
//! discovered pages, or leave the scenario unset for free-form generation.

use serde::Serialize;

use super::models::{DiscoveredPage, ElementKind};

/// Scenario value that selects a template from discovery output.
pub const AUTO_SCENARIO: &str = "auto";

/// Steps, validations and selectors included in a generation prompt.
pub const MAX_PROMPT_STEPS: usize = 8;
pub const MAX_PROMPT_VALIDATIONS: usize = 5;
pub const MAX_PROMPT_SELECTORS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioTemplate {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub steps: &'static [&'static str],
    pub key_selectors: &'static [&'static str],
    pub validations: &'static [&'static str],
}

pub static SCENARIO_TEMPLATES: &[ScenarioTemplate] = &[
    ScenarioTemplate {
        id: "homepage-navigation",
        name: "Homepage & Main Navigation",
        description: "Homepage structure, primary navigation and footer",
        steps: &[
            "Open the homepage",
            "Dismiss any language or cookie interstitial",
            "Verify the logo and main navigation",
            "Open each top-level menu item",
            "Verify the footer links",
            "Check basic accessibility landmarks",
        ],
        key_selectors: &["nav", "header", "footer", ".logo", "button"],
        validations: &[
            "Page title is not empty",
            "Main navigation is visible",
            "Footer is present",
        ],
    },
    ScenarioTemplate {
        id: "about-contact",
        name: "About & Contact Pages",
        description: "About page content and contact or support details",
        steps: &[
            "Navigate to the About page",
            "Verify the mission or overview section",
            "Navigate to the Contact page",
            "Verify phone, email or address details",
            "Check the support or feedback link",
        ],
        key_selectors: &["a[href*='about']", "a[href*='contact']", "address", "a[href^='mailto:']"],
        validations: &[
            "About page loads",
            "Contact details present",
            "Support link exists",
        ],
    },
    ScenarioTemplate {
        id: "site-search",
        name: "Site Search",
        description: "Search input, submission and results display",
        steps: &[
            "Locate the search input",
            "Submit a query for a term visible on the homepage",
            "Verify the results page or panel appears",
            "Submit an empty query",
            "Verify the empty query is handled",
        ],
        key_selectors: &["input[type='search']", "input[name='q']", "button[type='submit']", "form[role='search']"],
        validations: &[
            "Search input accepts text",
            "Results are displayed",
            "Empty query does not error",
        ],
    },
    ScenarioTemplate {
        id: "forms",
        name: "Forms & Input Validation",
        description: "Form fields, dropdowns and client-side validation",
        steps: &[
            "Open a page containing a form",
            "Check that required fields are marked",
            "Submit the form empty",
            "Verify validation messages",
            "Fill every field with valid values",
            "Check dropdowns are populated",
        ],
        key_selectors: &["form", "input", "select", "textarea", "button[type='submit']"],
        validations: &[
            "Required fields are enforced",
            "Dropdowns have options",
            "Valid input is accepted",
        ],
    },
    ScenarioTemplate {
        id: "faqs-help",
        name: "FAQs & Help Resources",
        description: "FAQ section, expandable answers and help links",
        steps: &[
            "Navigate to the FAQ or Help section",
            "Check FAQ categories",
            "Expand and collapse an answer",
            "Follow a help resource link",
        ],
        key_selectors: &["a[href*='faq']", "a[href*='help']", "details", "[aria-expanded]"],
        validations: &[
            "FAQ page loads",
            "Answers expand",
            "Help links resolve",
        ],
    },
    ScenarioTemplate {
        id: "downloads-resources",
        name: "Downloads & Resources",
        description: "Download listings, documents and resource links",
        steps: &[
            "Navigate to the Downloads or Resources section",
            "Check that documents are listed",
            "Verify download links point at files",
            "Check link text describes each document",
        ],
        key_selectors: &["a[href$='.pdf']", "a[download]", "a[href*='download']"],
        validations: &[
            "Downloads page accessible",
            "Documents listed",
            "Download links are not broken",
        ],
    },
];

/// Keywords that select a template during auto-detection, checked in order.
const DETECTION_RULES: &[(&str, &[&str])] = &[
    ("downloads-resources", &["download", ".pdf", "resources"]),
    ("faqs-help", &["faq", "help"]),
    ("about-contact", &["about", "contact"]),
    ("site-search", &["search"]),
];

const DEFAULT_TEMPLATE: &str = "homepage-navigation";

pub fn find(id: &str) -> Option<&'static ScenarioTemplate> {
    SCENARIO_TEMPLATES.iter().find(|t| t.id == id)
}

/// Pick the template that best matches what discovery found.
pub fn detect(pages: &[DiscoveredPage]) -> &'static ScenarioTemplate {
    let mut haystack = String::new();
    for page in pages {
        haystack.push_str(&page.url);
        haystack.push(' ');
        for link in &page.links {
            haystack.push_str(link);
            haystack.push(' ');
        }
        for element in &page.elements {
            haystack.push_str(&element.selector);
            haystack.push(' ');
            if let Some(text) = &element.text {
                haystack.push_str(text);
                haystack.push(' ');
            }
        }
    }
    let haystack = haystack.to_lowercase();

    let id = DETECTION_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| haystack.contains(k)))
        .map(|(id, _)| *id)
        .or_else(|| {
            let has_form = pages
                .iter()
                .flat_map(|p| &p.elements)
                .any(|e| matches!(e.kind, ElementKind::Form | ElementKind::Select | ElementKind::TextArea));
            has_form.then_some("forms")
        })
        .unwrap_or(DEFAULT_TEMPLATE);
    find(id).unwrap_or(&SCENARIO_TEMPLATES[0])
}

/// The template a run's scenario setting resolves to, if any.
pub fn resolve(scenario: Option<&str>, pages: &[DiscoveredPage]) -> Option<&'static ScenarioTemplate> {
    match scenario? {
        AUTO_SCENARIO => Some(detect(pages)),
        id => find(id),
    }
}

/// Catalog entry returned by the templates endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSummary {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub steps: usize,
}

pub fn summaries() -> Vec<ScenarioSummary> {
    SCENARIO_TEMPLATES
        .iter()
        .map(|t| ScenarioSummary {
            id: t.id,
            name: t.name,
            description: t.description,
            steps: t.steps.len(),
        })
        .collect()
}

/// Prompt section describing the scenario to cover.
pub fn prompt_section(template: &ScenarioTemplate) -> String {
    let mut section = format!("\nScenario to cover: {}\n{}\n\nSteps:\n", template.name, template.description);
    for (i, step) in template.steps.iter().take(MAX_PROMPT_STEPS).enumerate() {
        section.push_str(&format!("{}. {}\n", i + 1, step));
    }
    section.push_str("\nValidate:\n");
    for validation in template.validations.iter().take(MAX_PROMPT_VALIDATIONS) {
        section.push_str(&format!("- {}\n", validation));
    }
    section.push_str("\nSelectors likely to be relevant:\n");
    for selector in template.key_selectors.iter().take(MAX_PROMPT_SELECTORS) {
        section.push_str(&format!("- {}\n", selector));
    }
    section
}
