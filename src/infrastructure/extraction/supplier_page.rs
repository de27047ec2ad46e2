//! Supplier profile page parser

use scraper::Html;

use super::rules::RuleSet;
use super::{compile_selectors, select_first_text, ExtractionError, RawSupplier};

/// Extract a raw supplier from a profile page under one rule-set
pub fn parse(html: &Html, source_url: &str, rules: &RuleSet) -> Result<RawSupplier, ExtractionError> {
    let root = html.root_element();

    let name_selectors = compile_selectors(&rules.supplier_name)?;
    let name = select_first_text(&root, &name_selectors).unwrap_or_default();

    let mut supplier = RawSupplier {
        source_id: supplier_id_from_url(source_url),
        source_url: source_url.to_string(),
        name,
        source_version: rules.source_version.clone(),
        ..Default::default()
    };

    if let Ok(selectors) = compile_selectors(&rules.company_name) {
        supplier.company_name = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.location) {
        supplier.location_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.business_type) {
        supplier.business_type_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.main_products) {
        supplier.main_products_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.rating) {
        supplier.rating_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.response_rate) {
        supplier.response_rate_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.verified_badge) {
        supplier.verified_text = select_first_text(&root, &selectors)
            .or_else(|| selectors.iter().any(|s| html.select(s).next().is_some()).then(|| "verified".to_string()));
    }
    if let Ok(selectors) = compile_selectors(&rules.established) {
        supplier.established_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.registered_capital) {
        supplier.registered_capital_text = select_first_text(&root, &selectors);
    }
    if let Ok(selectors) = compile_selectors(&rules.certification_items) {
        supplier.certifications = selectors
            .iter()
            .flat_map(|selector| html.select(selector))
            .map(|element| element.text().collect::<String>().trim().to_string())
            .filter(|text| !text.is_empty())
            .collect();
    }

    Ok(supplier)
}

fn supplier_id_from_url(url: &str) -> Option<String> {
    static SHOP_RE: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"(?:member|shop|supplier)/([A-Za-z0-9_\-]+)").expect("shop regex")
    });
    SHOP_RE.captures(url).map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::super::Extractor;

    const SUPPLIER_HTML: &str = r#"
        <html><body>
          <div class="s-profile">
            <h1 class="shop-name">烟台果业</h1>
            <div class="company-name">烟台果业商贸有限公司</div>
            <div class="business-type">生产厂家</div>
            <div class="location">山东 烟台</div>
            <div class="main-products">苹果, 梨, 樱桃</div>
            <div class="established">2015年3月8日</div>
            <div class="registered-capital">500万元</div>
          </div>
          <div class="s-rating"><span class="score">4.9</span><span class="response-rate">98%</span></div>
          <div class="s-verified">已认证</div>
          <div class="s-certs"><div class="cert-item">ISO9001</div><div class="cert-item">HACCP</div></div>
        </body></html>
    "#;

    #[test]
    fn parses_supplier_profile() {
        let extractor = Extractor::with_defaults();
        let supplier = extractor
            .extract_supplier_page(SUPPLIER_HTML, "https://shop.example.com/member/sup-88.html")
            .unwrap();

        assert_eq!(supplier.source_id.as_deref(), Some("sup-88"));
        assert_eq!(supplier.name, "烟台果业");
        assert_eq!(supplier.company_name.as_deref(), Some("烟台果业商贸有限公司"));
        assert_eq!(supplier.business_type_text.as_deref(), Some("生产厂家"));
        assert_eq!(supplier.verified_text.as_deref(), Some("已认证"));
        assert_eq!(supplier.certifications, vec!["ISO9001".to_string(), "HACCP".to_string()]);
    }
}
