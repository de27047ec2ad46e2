//! Listing page parser

use scraper::Html;

use super::rules::RuleSet;
use super::{
    compile_selectors, resolve_url, select_first_attr, select_first_text, source_id_from_url,
    ExtractionError, RawListEntry, RawListPage,
};

/// Extract listing entries and the next-page link under one rule-set
pub fn parse(html: &Html, base_url: &str, rules: &RuleSet) -> Result<RawListPage, ExtractionError> {
    let containers = compile_selectors(&rules.entry_container)?;
    let links = compile_selectors(&rules.entry_link)?;
    let prices = compile_selectors(&rules.entry_price).unwrap_or_default();
    let suppliers = compile_selectors(&rules.entry_supplier).unwrap_or_default();
    let next_page = compile_selectors(&rules.next_page).unwrap_or_default();

    let mut entries = Vec::new();
    let root = html.root_element();

    for container_selector in &containers {
        for container in html.select(container_selector) {
            let Some(href) = select_first_attr(&container, &links, &["href"]) else {
                continue;
            };
            let Some(url) = resolve_url(base_url, &href) else {
                continue;
            };
            let title = select_first_text(&container, &links).unwrap_or_default();
            if title.is_empty() {
                continue;
            }

            entries.push(RawListEntry {
                source_id: source_id_from_url(&url),
                url,
                title,
                price_text: select_first_text(&container, &prices),
                supplier_name: select_first_text(&container, &suppliers),
            });
        }
        if !entries.is_empty() {
            break;
        }
    }

    let next_page_url = select_first_attr(&root, &next_page, &["href"])
        .and_then(|href| resolve_url(base_url, &href));

    Ok(RawListPage {
        entries,
        next_page_url,
        source_version: rules.source_version.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::Extractor;

    const LIST_HTML: &str = r#"
        <html><body>
          <div class="offer-list">
            <div class="offer-item">
              <div class="offer-title"><a href="/offer/111.html">红苹果 500g 批发</a></div>
              <div class="offer-price"><span class="price">¥2.50</span></div>
              <div class="offer-company">烟台果业有限公司</div>
            </div>
            <div class="offer-item">
              <div class="offer-title"><a href="//shop.example.com/offer/222.html">绿梨 1kg</a></div>
              <div class="offer-price"><span class="price">¥3.80 - ¥4.20</span></div>
            </div>
          </div>
          <div class="pagination"><span class="next"><a href="/list?page=2">下一页</a></span></div>
        </body></html>
    "#;

    #[test]
    fn parses_entries_and_next_page() {
        let extractor = Extractor::with_defaults();
        let page = extractor
            .extract_list_page(LIST_HTML, "https://www.example.com/list?page=1")
            .unwrap();

        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].source_id.as_deref(), Some("111"));
        assert_eq!(page.entries[0].title, "红苹果 500g 批发");
        assert_eq!(page.entries[0].price_text.as_deref(), Some("¥2.50"));
        assert_eq!(page.entries[0].supplier_name.as_deref(), Some("烟台果业有限公司"));
        assert_eq!(page.entries[1].url, "https://shop.example.com/offer/222.html");
        assert_eq!(page.next_page_url.as_deref(), Some("https://www.example.com/list?page=2"));
    }
}
