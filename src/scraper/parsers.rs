use crate::error::ParseError;
use crate::models::{AgeBrackets, Classification, SchoolProfile, Scores};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::debug;
use url::Url;

use super::cleaner::{clean_field, clean_text, parse_count, parse_score, value_after_label};

fn compile(css: &'static str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|_| ParseError::InvalidSelector(css))
}

fn pattern(re: &'static str) -> Result<Regex, ParseError> {
    Regex::new(re).map_err(|_| ParseError::InvalidPattern(re))
}

fn text_of(el: ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<String>())
}

// ── Listing page ──────────────────────────────────────────────────────────────

const LINK_SELECTORS: [&str; 3] = [
    "#tabelabusca tbody tr td a",
    "table tbody tr td a",
    ".dataTable tbody tr td a",
];

#[derive(Debug, Default, PartialEq)]
pub struct ListingPage {
    /// Absolute detail URLs, first-seen order, no duplicates.
    pub detail_urls: Vec<String>,
    pub total_pages: Option<u32>,
    pub total_institutions: Option<u32>,
}

pub fn parse_listing_page(html: &str, base: &Url) -> Result<ListingPage, ParseError> {
    let doc = Html::parse_document(html);

    let mut anchors = Vec::new();
    for css in LINK_SELECTORS {
        let sel = compile(css)?;
        anchors = doc.select(&sel).collect();
        if !anchors.is_empty() {
            break;
        }
    }

    let mut seen = HashSet::new();
    let mut detail_urls = Vec::new();
    for a in anchors {
        let Some(href) = a.value().attr("href") else { continue };
        if !href.contains("DetalhesEscola") {
            continue;
        }
        let Ok(url) = base.join(href.trim()) else {
            debug!("Skipping unparseable link {:?}", href);
            continue;
        };
        let url = url.to_string();
        if seen.insert(url.clone()) {
            detail_urls.push(url);
        }
    }

    let paginate = compile(".paginate_button")?;
    let total_pages = doc
        .select(&paginate)
        .filter_map(|b| text_of(b).parse::<u32>().ok())
        .max();

    let info = compile("#tabelabusca_info")?;
    let registros = pattern(r"de (\d+(?:\.\d+)*) registros")?;
    let total_institutions = doc.select(&info).next().and_then(|el| {
        let text = text_of(el);
        let caps = registros.captures(&text)?;
        parse_count(caps.get(1)?.as_str())
    });

    Ok(ListingPage {
        detail_urls,
        total_pages,
        total_institutions,
    })
}

// ── Detail page ───────────────────────────────────────────────────────────────

/// Turns one detail page into a [`SchoolProfile`]. Implementations own the
/// markup binding; the rest of the pipeline only sees profiles.
pub trait Extractor: Send + Sync {
    fn extract(&self, html: &str) -> Result<SchoolProfile, ParseError>;
}

struct Selectors {
    content: Selector,
    name: Selector,
    tag: Selector,
    info_alunos: Selector,
    alunos: Selector,
    h2: Selector,
    quantity: Selector,
    table: Selector,
    tr: Selector,
    th: Selector,
    td: Selector,
    escola_dados: Selector,
    endereco: Selector,
    p: Selector,
    score_items: Selector,
    ul: Selector,
    li: Selector,
    score_title: Selector,
    ideb: Selector,
    idesp: Selector,
    infra_boxes: Selector,
    infra_title: Selector,
    infra_number: Selector,
}

impl Selectors {
    fn new() -> Result<Self, ParseError> {
        Ok(Self {
            content: compile("div.conteudo")?,
            name: compile("h2#nome-escola")?,
            tag: compile("div.tag p.tags")?,
            info_alunos: compile("div.info-alunos")?,
            alunos: compile("div.alunos")?,
            h2: compile("h2")?,
            quantity: compile("span#quantidade-alunos")?,
            table: compile("table")?,
            tr: compile("tr")?,
            th: compile("th")?,
            td: compile("td")?,
            escola_dados: compile("div.escola-dados")?,
            endereco: compile("p#endereco-escola")?,
            p: compile("p")?,
            score_items: compile("div.classificacao ul li")?,
            ul: compile("ul")?,
            li: compile("li")?,
            score_title: compile("h2.titulo-classificacao")?,
            ideb: compile("p#ideb-nota")?,
            idesp: compile("p#idesp-nota")?,
            infra_boxes: compile("div.infraestrutura-escola div.infraestrutura div.box")?,
            infra_title: compile("div.titulo b#tituloInfraestrutura")?,
            infra_number: compile("div.inf ul li span#numeroInfraestrutura")?,
        })
    }
}

/// Age-bracket cell addressed by a row label such as "11 a 14 anos".
fn bracket_slot<'a>(brackets: &'a mut AgeBrackets, label: &str) -> Option<&'a mut Option<u32>> {
    if label.starts_with("06 a 10") || label.starts_with("6 a 10") {
        Some(&mut brackets.age_06_10)
    } else if label.starts_with("11 a 14") {
        Some(&mut brackets.age_11_14)
    } else if label.starts_with("15 a 17") {
        Some(&mut brackets.age_15_17)
    } else if label.contains("18") {
        Some(&mut brackets.age_18_plus)
    } else {
        None
    }
}

const DIRECTORATE_LABEL: &str = "Diretoria de Ensino:";
const NEIGHBORHOOD_LABEL: &str = "Bairro:";
const MUNICIPALITY_LABEL: &str = "Município:";

/// Selector binding for the EDSP "DetalhesEscola" page.
pub struct EdspExtractor {
    sel: Selectors,
    phone: Regex,
    email: Regex,
}

impl EdspExtractor {
    pub fn new() -> Result<Self, ParseError> {
        Ok(Self {
            sel: Selectors::new()?,
            phone: pattern(r"\(\d{2}\)\s*\d{4,5}-?\d{4}")?,
            email: pattern(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}")?,
        })
    }

    fn first_text(&self, scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
        scope.select(sel).next().map(text_of)
    }

    /// Indices of the "Anos finais" and "Ensino Médio" columns, read from the
    /// first row carrying `th` cells (thead or tbody).
    fn segment_columns(&self, table: ElementRef<'_>) -> (Option<usize>, Option<usize>) {
        let Some(header) = table
            .select(&self.sel.tr)
            .find(|tr| tr.select(&self.sel.th).next().is_some())
        else {
            return (None, None);
        };

        let headers: Vec<String> = header
            .select(&self.sel.th)
            .map(|th| text_of(th).to_lowercase())
            .collect();

        let final_years = headers.iter().position(|h| h.starts_with("anos finais"));
        let high_school = headers.iter().position(|h| h.starts_with("ensino médio"));
        (final_years, high_school)
    }

    fn data_rows(&self, table: ElementRef<'_>) -> Vec<Vec<String>> {
        table
            .select(&self.sel.tr)
            .map(|tr| tr.select(&self.sel.td).map(text_of).collect::<Vec<_>>())
            .filter(|cells| !cells.is_empty())
            .collect()
    }

    fn read_students(&self, block: ElementRef<'_>, alunos: ElementRef<'_>, out: &mut SchoolProfile) {
        out.total_students = self
            .first_text(alunos, &self.sel.quantity)
            .and_then(|t| parse_count(&t));

        let Some(table) = block.select(&self.sel.table).next() else { return };
        let (fy_idx, hs_idx) = self.segment_columns(table);

        for cells in self.data_rows(table) {
            let cell = |idx: Option<usize>| idx.and_then(|i| cells.get(i)).and_then(|c| parse_count(c));
            let (fy, hs) = (cell(fy_idx), cell(hs_idx));

            let label = cells[0].to_lowercase();
            if let Some(s) = bracket_slot(&mut out.final_years, &label) {
                *s = fy;
            }
            if let Some(s) = bracket_slot(&mut out.high_school, &label) {
                *s = hs;
            }
        }
    }

    fn read_classes(&self, block: ElementRef<'_>, alunos: ElementRef<'_>, out: &mut SchoolProfile) {
        out.total_classes = self
            .first_text(alunos, &self.sel.quantity)
            .and_then(|t| parse_count(&t));

        let Some(table) = block.select(&self.sel.table).next() else { return };
        let (fy_idx, hs_idx) = self.segment_columns(table);

        for cells in self.data_rows(table) {
            let cell = |idx: Option<usize>| idx.and_then(|i| cells.get(i)).and_then(|c| parse_count(c));
            out.classes_final_years = cell(fy_idx);
            out.classes_high_school = cell(hs_idx);
        }
    }

    fn read_enrollment(&self, content: ElementRef<'_>, out: &mut SchoolProfile) {
        for block in content.select(&self.sel.info_alunos) {
            let Some(alunos) = block.select(&self.sel.alunos).next() else { continue };
            let Some(title) = self.first_text(alunos, &self.sel.h2) else { continue };

            match title.as_str() {
                "Alunos" => self.read_students(block, alunos, out),
                "Total de Turmas" => self.read_classes(block, alunos, out),
                other => debug!("Ignoring info-alunos block {:?}", other),
            }
        }

        if out.total_students.is_none() {
            out.total_students = content
                .select(&self.sel.alunos)
                .next()
                .and_then(|a| self.first_text(a, &self.sel.quantity))
                .and_then(|t| parse_count(&t));
        }
    }

    /// Fill whichever location/contact fields are still empty from `paragraphs`.
    fn scan_paragraphs<'a>(&self, paragraphs: impl Iterator<Item = ElementRef<'a>>, out: &mut SchoolProfile) {
        for p in paragraphs {
            let text = text_of(p);

            if out.teaching_directorate.is_empty() {
                if let Some(v) = value_after_label(&text, DIRECTORATE_LABEL) {
                    out.teaching_directorate = v;
                }
            }
            if out.neighborhood.is_empty() {
                if let Some(v) = value_after_label(&text, NEIGHBORHOOD_LABEL) {
                    out.neighborhood = v;
                }
            }
            if out.municipality.is_empty() {
                if let Some(v) = value_after_label(&text, MUNICIPALITY_LABEL) {
                    out.municipality = v;
                }
            }
            if out.phone.is_empty() && text.contains('(') {
                if let Some(m) = self.phone.find(&text) {
                    out.phone = m.as_str().to_string();
                }
            }
            if out.email.is_empty() && text.contains('@') {
                if let Some(m) = self.email.find(&text) {
                    out.email = m.as_str().to_string();
                }
            }
        }
    }

    fn read_location(&self, content: ElementRef<'_>, out: &mut SchoolProfile) {
        if let Some(dados) = content.select(&self.sel.escola_dados).next() {
            if let Some(text) = self.first_text(dados, &self.sel.endereco) {
                if let Some(v) = value_after_label(&text, DIRECTORATE_LABEL) {
                    out.teaching_directorate = v;
                }
            }
            self.scan_paragraphs(dados.select(&self.sel.p), out);
        }

        if out.teaching_directorate.is_empty() || out.neighborhood.is_empty() || out.municipality.is_empty() {
            self.scan_paragraphs(content.select(&self.sel.p), out);
        }
    }

    fn apply_scores<'a>(&self, items: impl Iterator<Item = ElementRef<'a>>, scores: &mut Scores) {
        for li in items {
            let Some(title) = self.first_text(li, &self.sel.score_title) else { continue };
            let ideb = self.first_text(li, &self.sel.ideb).and_then(|t| parse_score(&t));
            let idesp = self.first_text(li, &self.sel.idesp).and_then(|t| parse_score(&t));

            match title.to_lowercase().as_str() {
                "anos finais" => {
                    scores.ideb_final_years = ideb;
                    scores.idesp_final_years = idesp;
                }
                "ensino médio" => {
                    scores.ideb_high_school = ideb;
                    scores.idesp_high_school = idesp;
                }
                _ => {}
            }
        }
    }

    fn read_scores(&self, content: ElementRef<'_>, out: &mut SchoolProfile) {
        self.apply_scores(content.select(&self.sel.score_items), &mut out.scores);

        if out.scores.is_empty() {
            if let Some(ul) = content.select(&self.sel.ul).next() {
                self.apply_scores(ul.select(&self.sel.li), &mut out.scores);
            }
        }
    }

    fn read_classrooms(&self, content: ElementRef<'_>, out: &mut SchoolProfile) {
        out.total_classrooms = content
            .select(&self.sel.infra_boxes)
            .find(|b| self.first_text(*b, &self.sel.infra_title).as_deref() == Some("Salas de Aula"))
            .and_then(|b| self.first_text(b, &self.sel.infra_number))
            .and_then(|t| parse_count(&t));
    }
}

impl Extractor for EdspExtractor {
    fn extract(&self, html: &str) -> Result<SchoolProfile, ParseError> {
        let doc = Html::parse_document(html);
        let content = doc
            .select(&self.sel.content)
            .next()
            .ok_or(ParseError::MissingStructure("div.conteudo"))?;

        let mut profile = SchoolProfile {
            name: self.first_text(content, &self.sel.name).map(|t| clean_field(&t)).unwrap_or_default(),
            classification: self
                .first_text(content, &self.sel.tag)
                .map(|t| Classification::from_text(&t))
                .unwrap_or(Classification::Unknown),
            ..Default::default()
        };

        self.read_enrollment(content, &mut profile);
        self.read_location(content, &mut profile);
        self.read_scores(content, &mut profile);
        self.read_classrooms(content, &mut profile);

        debug!(
            "{}: students={:?} classes={:?} classrooms={:?}",
            profile.name, profile.total_students, profile.total_classes, profile.total_classrooms
        );

        Ok(profile)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const DETAIL: &str = include_str!("fixtures/school_detail.html");
    const LISTING: &str = include_str!("fixtures/listing_page.html");

    fn extractor() -> EdspExtractor {
        EdspExtractor::new().unwrap()
    }

    fn golden_profile() -> SchoolProfile {
        SchoolProfile {
            name: "EE PROFESSOR JOSE DA SILVA".into(),
            classification: Classification::Pei,
            teaching_directorate: "CENTRO OESTE".into(),
            neighborhood: "VILA MARIANA".into(),
            municipality: "SAO PAULO".into(),
            phone: "(11) 5555-1234".into(),
            email: "e901234a@educacao.sp.gov.br".into(),
            scores: Scores {
                ideb_final_years: Some(5.2),
                idesp_final_years: Some(4.13),
                ideb_high_school: Some(4.6),
                idesp_high_school: None,
            },
            total_students: Some(1234),
            final_years: AgeBrackets {
                age_06_10: Some(12),
                age_11_14: Some(480),
                age_15_17: Some(20),
                age_18_plus: Some(0),
            },
            high_school: AgeBrackets {
                age_06_10: None,
                age_11_14: Some(3),
                age_15_17: Some(610),
                age_18_plus: Some(109),
            },
            total_classes: Some(38),
            classes_final_years: Some(17),
            classes_high_school: Some(21),
            total_classrooms: Some(24),
        }
    }

    #[test]
    fn extracts_every_field_from_full_page() {
        let profile = extractor().extract(DETAIL).unwrap();
        assert_eq!(profile, golden_profile());
    }

    #[test]
    fn missing_phone_still_succeeds() {
        let html = DETAIL.replace("<p>Telefone: (11) 5555-1234</p>", "");
        let profile = extractor().extract(&html).unwrap();

        assert_eq!(profile.phone, "");
        assert_eq!(profile.email, "e901234a@educacao.sp.gov.br");
        assert_eq!(profile.total_classrooms, Some(24));
    }

    #[test]
    fn missing_infrastructure_leaves_classrooms_empty() {
        let html = DETAIL.replace("Salas de Aula", "Laboratórios");
        let profile = extractor().extract(&html).unwrap();
        assert_eq!(profile.total_classrooms, None);
    }

    #[test]
    fn location_falls_back_to_any_paragraph() {
        let html = DETAIL.replace("class=\"escola-dados\"", "class=\"dados-antigos\"");
        let profile = extractor().extract(&html).unwrap();

        assert_eq!(profile.teaching_directorate, "CENTRO OESTE");
        assert_eq!(profile.neighborhood, "VILA MARIANA");
        assert_eq!(profile.municipality, "SAO PAULO");
        assert_eq!(profile.phone, "(11) 5555-1234");
    }

    #[test]
    fn scores_fall_back_to_first_list() {
        let html = DETAIL.replace("class=\"classificacao\"", "class=\"notas\"");
        let profile = extractor().extract(&html).unwrap();
        assert_eq!(profile.scores, golden_profile().scores);
    }

    #[test]
    fn page_without_content_block_is_a_parse_error() {
        let err = extractor()
            .extract("<html><body><p>Em manutenção</p></body></html>")
            .unwrap_err();
        assert_eq!(err, ParseError::MissingStructure("div.conteudo"));
    }

    #[test]
    fn bare_content_block_yields_empty_profile() {
        let profile = extractor()
            .extract("<html><body><div class=\"conteudo\"></div></body></html>")
            .unwrap();
        assert_eq!(profile, SchoolProfile::default());
    }

    #[test]
    fn listing_links_are_filtered_resolved_and_deduplicated() {
        let base = Url::parse("https://transparencia.educacao.sp.gov.br/Home/MapaDeEscolasPorDiretoria").unwrap();
        let listing = parse_listing_page(LISTING, &base).unwrap();

        assert_eq!(
            listing.detail_urls,
            vec![
                "https://transparencia.educacao.sp.gov.br/Home/DetalhesEscola?codesc=901234".to_string(),
                "https://transparencia.educacao.sp.gov.br/Home/DetalhesEscola?codesc=905678".to_string(),
            ]
        );
        assert_eq!(listing.total_pages, Some(55));
        assert_eq!(listing.total_institutions, Some(5432));
    }

    #[test]
    fn listing_without_pagination() {
        let base = Url::parse("https://example.test/").unwrap();
        let listing = parse_listing_page("<html><body><p>vazio</p></body></html>", &base).unwrap();
        assert_eq!(listing, ListingPage::default());
    }
}
