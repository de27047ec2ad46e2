//! Product detail page parser

use scraper::{Html, Selector};

use super::rules::RuleSet;
use super::{
    compile_selectors, resolve_url, select_first_attr, select_first_text, source_id_from_url,
    ExtractionError, RawProduct,
};

/// Extract a raw product from a detail page under one rule-set
pub fn parse(html: &Html, source_url: &str, rules: &RuleSet) -> Result<RawProduct, ExtractionError> {
    let root = html.root_element();

    let title_selectors = compile_selectors(&rules.title)?;
    let title = select_first_text(&root, &title_selectors).unwrap_or_default();

    let mut product = RawProduct {
        source_id: source_id_from_url(source_url),
        source_url: source_url.to_string(),
        title,
        source_version: rules.source_version.clone(),
        ..Default::default()
    };

    if let Ok(selectors) = compile_selectors(&rules.subtitle) {
        product.subtitle = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.description) {
        product.description_html = first_inner_html(html, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.price) {
        product.price_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.moq) {
        product.moq_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.unit) {
        product.unit_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.location) {
        product.location_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.sales) {
        product.sales_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.reviews) {
        product.review_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.rating) {
        product.rating_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.category) {
        product.category_name = select_first_text(&root, &selectors);
    }

    if let Ok(selectors) = compile_selectors(&rules.images) {
        product.image_urls = collect_images(html, source_url, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.spec_rows) {
        product.specifications = collect_specifications(html, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.supplier_link) {
        product.supplier_name = select_first_text(&root, &selectors);
        if let Some(href) = select_first_attr(&root, &selectors, &["href"]) {
            product.supplier_source_id = supplier_id_from_href(&href);
        }
    }

    Ok(product)
}

fn first_inner_html(html: &Html, selectors: &[Selector]) -> Option<String> {
    for selector in selectors {
        if let Some(element) = html.select(selector).next() {
            let inner = element.inner_html();
            if !inner.trim().is_empty() {
                return Some(inner);
            }
        }
    }
    None
}

/// Image URLs in page order, deduplicated, icons filtered out
fn collect_images(html: &Html, base_url: &str, selectors: &[Selector]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();

    for selector in selectors {
        for element in html.select(selector) {
            let raw = element
                .value()
                .attr("data-src")
                .or_else(|| element.value().attr("src"));
            let Some(raw) = raw else { continue };
            let Some(url) = resolve_url(base_url, raw.trim()) else { continue };

            let lower = url.to_lowercase();
            if ["icon", "logo", "avatar"].iter().any(|noise| lower.contains(noise)) {
                continue;
            }
            if seen.insert(url.clone()) {
                urls.push(url);
            }
        }
        if !urls.is_empty() {
            break;
        }
    }

    urls.truncate(20);
    urls
}

/// Key/value pairs from attribute tables or definition rows
fn collect_specifications(html: &Html, selectors: &[Selector]) -> Vec<(String, String)> {
    let cell = Selector::parse("td").expect("td selector");
    let name = Selector::parse(".attr-name, .spec-name, .label, dt").expect("name selector");
    let value = Selector::parse(".attr-value, .spec-value, .value, dd").expect("value selector");

    let mut specs = Vec::new();
    for selector in selectors {
        for row in html.select(selector) {
            let cells: Vec<_> = row.select(&cell).collect();
            let pair = if cells.len() >= 2 {
                let key: String = cells[0].text().collect::<String>();
                let val: String = cells[1].text().collect::<String>();
                Some((key, val))
            } else {
                let key = row.select(&name).next().map(|e| e.text().collect::<String>());
                let val = row.select(&value).next().map(|e| e.text().collect::<String>());
                key.zip(val)
            };

            if let Some((key, val)) = pair {
                let key = key.trim().trim_end_matches([':', '：']).trim().to_string();
                let val = val.trim().to_string();
                if !key.is_empty() && !val.is_empty() {
                    specs.push((key, val));
                }
            }
        }
        if !specs.is_empty() {
            break;
        }
    }
    specs
}

fn supplier_id_from_href(href: &str) -> Option<String> {
    static MEMBER_RE: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"(?:member|shop|supplier)/([A-Za-z0-9_\-]+)").expect("member regex"));
    MEMBER_RE.captures(href).map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::super::Extractor;

    const DETAIL_HTML: &str = r#"
        <html><body>
          <div class="d-title"><h1>红苹果 500g 产地直发</h1><span class="sub-title">脆甜多汁</span></div>
          <div class="d-price"><span class="price">¥2.50 - ¥3.20</span><span class="unit">/件</span></div>
          <div class="d-order"><span class="moq">100件起批</span></div>
          <div class="d-gallery">
            <img src="//img.example.com/main.jpg" />
            <img data-src="//img.example.com/detail-1.jpg" />
            <img src="//img.example.com/icon-cart.png" />
          </div>
          <div class="d-attributes"><table>
            <tr><td>产地：</td><td>山东烟台</td></tr>
            <tr><td>规格</td><td>500g/袋</td></tr>
          </table></div>
          <div class="d-seller"><span class="seller-name"><a href="https://shop.example.com/member/sup-88.html">烟台果业</a></span>
            <span class="location">山东 烟台</span></div>
          <div class="d-sales"><span class="count">已售 3200件</span></div>
          <div class="d-rating"><span class="score">4.8</span></div>
        </body></html>
    "#;

    #[test]
    fn parses_full_detail_page() {
        let extractor = Extractor::with_defaults();
        let product = extractor
            .extract_detail_page(DETAIL_HTML, "https://www.example.com/offer/7283911.html")
            .unwrap();

        assert_eq!(product.source_id.as_deref(), Some("7283911"));
        assert_eq!(product.title, "红苹果 500g 产地直发");
        assert_eq!(product.subtitle.as_deref(), Some("脆甜多汁"));
        assert_eq!(product.price_text.as_deref(), Some("¥2.50 - ¥3.20"));
        assert_eq!(product.moq_text.as_deref(), Some("100件起批"));
        assert_eq!(product.image_urls.len(), 2, "icon image filtered");
        assert_eq!(product.specifications.len(), 2);
        assert_eq!(product.specifications[0], ("产地".to_string(), "山东烟台".to_string()));
        assert_eq!(product.supplier_name.as_deref(), Some("烟台果业"));
        assert_eq!(product.supplier_source_id.as_deref(), Some("sup-88"));
        assert_eq!(product.sales_text.as_deref(), Some("已售 3200件"));
        assert_eq!(product.source_version, "v2");
    }
}
