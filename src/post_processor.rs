//! Deterministic synthesis post-processing.
//!
//! A pure safety net that guarantees every web source and prior section
//! gets a source marker and an inline label in the synthesis text — model
//! compliance with citation conventions is unreliable, so it is never
//! trusted to do this itself.
//!
//! Grounded on the keyword-overlap-scoring idiom used by
//! `cloudllm::context_strategy::NoveltyAwareStrategy::estimate_novelty`
//! (bigram overlap ratio), generalized from "novelty vs. recent history" to
//! "best-matching section/sentence for a given source".

const STOP_WORDS: &[&str] = &[
    "the", "and", "that", "this", "with", "from", "have", "has", "was", "were", "are", "for",
    "not", "but", "his", "her", "its", "they", "them", "their", "which", "what", "when", "where",
    "who", "how", "will", "would", "could", "should", "can", "may", "might", "shall", "into",
    "onto", "than", "then", "also", "such", "some", "more", "most", "other", "each", "about",
];

/// A web source surfaced by websearch calibration.
#[derive(Debug, Clone)]
pub struct WebSource {
    pub url: String,
    pub insight: String,
}

/// A prior section surfaced by the follow-up context loader.
#[derive(Debug, Clone)]
pub struct PriorSectionSource {
    pub section_id: String,
    pub heading: String,
    pub excerpt: String,
}

fn keywords(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .filter(|w| !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

fn overlap_score(a: &str, b: &str) -> f64 {
    let a_words: std::collections::HashSet<String> = keywords(a).into_iter().collect();
    let b_words: std::collections::HashSet<String> = keywords(b).into_iter().collect();
    if a_words.is_empty() || b_words.is_empty() {
        return 0.0;
    }
    let intersection = a_words.intersection(&b_words).count() as f64;
    intersection / (a_words.len().max(b_words.len()) as f64)
}

fn hostname(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or(url)
        .to_string()
}

struct Section {
    heading: Option<String>,
    body: String,
}

fn split_into_sections(synthesis: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current_heading: Option<String> = None;
    let mut current_body = String::new();
    for line in synthesis.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            if current_heading.is_some() || !current_body.trim().is_empty() {
                sections.push(Section {
                    heading: current_heading.take(),
                    body: current_body.clone(),
                });
            }
            current_heading = Some(heading.trim().to_string());
            current_body = String::new();
        } else {
            current_body.push_str(line);
            current_body.push('\n');
        }
    }
    sections.push(Section {
        heading: current_heading,
        body: current_body,
    });
    sections
}

fn join_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| match &s.heading {
            Some(h) => format!("## {}\n{}", h, s.body),
            None => s.body.clone(),
        })
        .collect::<Vec<_>>()
        .join("")
}

/// Injects a `marker_line` into the best-scoring section's `> **Sources**`
/// blockquote, appending one at the end of that section if it doesn't yet
/// have one. `already_present` is checked first so injection never
/// duplicates.
fn inject_marker(sections: &mut [Section], insight: &str, marker_line: &str, already_present: &dyn Fn(&str) -> bool) {
    let joined_before = join_sections(sections);
    if already_present(&joined_before) {
        return;
    }
    let best_idx = sections
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            overlap_score(&a.body, insight)
                .partial_cmp(&overlap_score(&b.body, insight))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0);
    let section = &mut sections[best_idx];
    if let Some(pos) = section.body.find("> **Sources**") {
        let line_end = section.body[pos..].find('\n').map(|i| pos + i).unwrap_or(section.body.len());
        section.body.insert_str(line_end, &format!("\n> {}", marker_line));
    } else {
        if !section.body.ends_with('\n') {
            section.body.push('\n');
        }
        section.body.push_str(&format!("\n> **Sources**\n> {}\n", marker_line));
    }
}

/// Injects `label` just before a trailing period of the best-scoring
/// substantial prose sentence, or at the first substantial prose line
/// (length ≥ 20, not heading/blockquote/marker) if nothing clears the
/// `0.05` keyword-overlap threshold.
fn inject_label(sections: &mut [Section], insight: &str, label: &str) {
    let joined = join_sections(sections);
    if joined.contains(label) {
        return;
    }

    let mut best: Option<(usize, usize, usize, f64)> = None; // section, line, col-ish, score
    for (s_idx, section) in sections.iter().enumerate() {
        for (l_idx, line) in section.body.lines().enumerate() {
            if is_candidate_prose_line(line) {
                let score = overlap_score(line, insight);
                if best.as_ref().map(|(_, _, _, b)| score > *b).unwrap_or(true) {
                    best = Some((s_idx, l_idx, line.len(), score));
                }
            }
        }
    }

    let fallback_needed = best.map(|(_, _, _, score)| score < 0.05).unwrap_or(true);

    let target = if fallback_needed {
        sections.iter().enumerate().find_map(|(s_idx, section)| {
            section
                .body
                .lines()
                .position(|line| is_candidate_prose_line(line) && line.trim().len() >= 20)
                .map(|l_idx| (s_idx, l_idx))
        })
    } else {
        best.map(|(s_idx, l_idx, _, _)| (s_idx, l_idx))
    };

    let Some((s_idx, l_idx)) = target else { return };
    let section = &mut sections[s_idx];
    let had_trailing_newline = section.body.ends_with('\n');
    let new_lines: Vec<String> = section
        .body
        .lines()
        .enumerate()
        .map(|(i, line)| {
            if i != l_idx {
                return line.to_string();
            }
            if let Some(stripped) = line.trim_end().strip_suffix('.') {
                format!("{} {}.", stripped, label)
            } else {
                format!("{} {}", line, label)
            }
        })
        .collect();
    section.body = new_lines.join("\n");
    if had_trailing_newline {
        section.body.push('\n');
    }
}

fn is_candidate_prose_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty()
        && !trimmed.starts_with('#')
        && !trimmed.starts_with('>')
        && !trimmed.contains("WEB_REF|")
        && !trimmed.contains("PRIOR_REF|")
}

/// Runs the full four-step marker-and-label injection algorithm. Idempotent:
/// running it twice on the same inputs produces the same output as running
/// it once, because every injection step first checks for an existing
/// marker/label.
pub fn post_process_synthesis(
    synthesis: &str,
    web_sources: &[WebSource],
    prior_sections: &[PriorSectionSource],
) -> String {
    let mut sections = split_into_sections(synthesis);

    for (i, source) in web_sources.iter().enumerate() {
        let host = hostname(&source.url);
        let marker_line = format!("WEB_REF|{}|{}", source.url, source.insight);
        let url = source.url.clone();
        inject_marker(&mut sections, &source.insight, &marker_line, &|joined: &str| {
            joined.contains(&format!("WEB_REF|{}|", url)) || joined.contains(&format!("WEB_REF|{}", host))
        });
        let label = format!("[W{}]", i + 1);
        inject_label(&mut sections, &source.insight, &label);
    }

    for (i, source) in prior_sections.iter().enumerate() {
        let marker_line = format!(
            "PRIOR_REF|{}|{}|{}",
            source.section_id, source.heading, source.excerpt
        );
        let section_id = source.section_id.clone();
        inject_marker(&mut sections, &source.excerpt, &marker_line, &|joined: &str| {
            joined.contains(&format!("PRIOR_REF|{}|", section_id))
        });
        let label = format!("[P{}]", i + 1);
        inject_label(&mut sections, &source.excerpt, &label);
    }

    join_sections(&sections)
}
