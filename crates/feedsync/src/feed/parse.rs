//! XML feed parsing.
//!
//! Two layouts are understood:
//!
//! - catalog feeds: `<products><product>...</product></products>`
//! - Google Shopping RSS: `<rss><channel><item>...</item></channel></rss>`
//!   with `g:`-prefixed fields
//!
//! Known fields map onto [`Product`]; everything else lands in
//! [`Product::extra`] under its original element name.

use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::Product;
use crate::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Catalog,
    Rss,
}

impl Layout {
    fn detect(root: &str) -> Option<Self> {
        match root {
            "products" => Some(Layout::Catalog),
            "rss" => Some(Layout::Rss),
            _ => None,
        }
    }

    /// Whether an element opened under `stack` starts a product record.
    fn is_record(&self, stack: &[Element], name: &str) -> bool {
        match self {
            Layout::Catalog => stack.len() == 1 && name == "product",
            Layout::Rss => stack.len() == 2 && stack[1].name == "channel" && name == "item",
        }
    }
}

struct Element {
    name: String,
    text: String,
}

/// Parses a raw feed body into products, in document order.
pub fn parse_feed(body: &[u8]) -> Result<Vec<Product>, ParseError> {
    let xml = std::str::from_utf8(body).map_err(|_| ParseError::Encoding)?;
    let xml = xml.trim_start_matches('\u{feff}');
    let mut reader = Reader::from_str(xml);

    let mut layout: Option<Layout> = None;
    let mut stack: Vec<Element> = Vec::new();
    let mut record: Option<(usize, Vec<(String, String)>)> = None;
    let mut products = Vec::new();

    loop {
        let event = reader.read_event().map_err(|e| ParseError::Xml {
            position: reader.buffer_position(),
            message: e.to_string(),
        })?;

        match event {
            Event::Start(ref e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if stack.is_empty() {
                    layout = Some(Layout::detect(&name).ok_or_else(|| {
                        ParseError::UnknownLayout(name.clone())
                    })?);
                } else if let Some(layout) = layout {
                    if record.is_none() && layout.is_record(&stack, &name) {
                        record = Some((stack.len(), Vec::new()));
                    }
                }
                stack.push(Element {
                    name,
                    text: String::new(),
                });
            }
            Event::Empty(ref e) => {
                if stack.is_empty() {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    return match Layout::detect(&name) {
                        Some(_) => Ok(products),
                        None => Err(ParseError::UnknownLayout(name)),
                    };
                }
            }
            Event::Text(e) => {
                if let Some(top) = stack.last_mut() {
                    let text = e.decode().map_err(|err| ParseError::Xml {
                        position: reader.buffer_position(),
                        message: err.to_string(),
                    })?;
                    top.text.push_str(&text);
                }
            }
            Event::CData(e) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::GeneralRef(e) => {
                if let Some(top) = stack.last_mut() {
                    if let Ok(Some(c)) = e.resolve_char_ref() {
                        top.text.push(c);
                    } else if let Ok(name) = e.decode() {
                        if let Some(resolved) = resolve_predefined_entity(&name) {
                            top.text.push_str(resolved);
                        }
                    }
                }
            }
            Event::End(_) => {
                let Some(element) = stack.pop() else {
                    continue;
                };
                match record.as_mut() {
                    Some((depth, _)) if *depth == stack.len() => {
                        if let Some((_, fields)) = record.take() {
                            products.push(build_product(fields));
                        }
                    }
                    Some((_, fields)) => {
                        let value = element.text.trim();
                        if !value.is_empty() {
                            fields.push((element.name, value.to_string()));
                        }
                    }
                    None => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if layout.is_none() {
        return Err(ParseError::UnknownLayout(String::new()));
    }
    if let Some(open) = stack.last() {
        return Err(ParseError::Xml {
            position: reader.buffer_position(),
            message: format!("unexpected end of document inside <{}>", open.name),
        });
    }

    Ok(products)
}

fn build_product(fields: Vec<(String, String)>) -> Product {
    let mut product = Product::default();
    let mut guid = String::new();
    let mut price_b2c = String::new();
    let mut quantity: Option<i64> = None;

    for (name, value) in fields {
        let key = name.strip_prefix("g:").unwrap_or(&name);
        match key {
            "id" => product.id = value,
            "guid" => guid = value,
            "name" | "title" => product.title = value,
            "description" => product.description = value,
            "url" | "link" => product.link = value,
            "price_b2c" => price_b2c = value,
            "price" => product.price = value,
            "availability" => product.availability = value,
            "quantity" | "stock" => quantity = Some(value.trim().parse().unwrap_or(0)),
            "brand" => product.brand = value,
            "avatar" | "image" | "image_link" => product.image = value,
            "gtin" | "ean" => product.gtin = value,
            "mpn" | "model" => product.mpn = value,
            "category" | "product_type" | "google_product_category" => {
                product.original_categories.push(value)
            }
            _ => {
                product.extra.entry(name).or_insert(value);
            }
        }
    }

    if product.id.is_empty() {
        product.id = guid;
    }
    product.sku = product.id.clone();
    if !price_b2c.is_empty() {
        product.price = price_b2c;
    }
    if let Some(quantity) = quantity {
        product.stock_quantity = quantity;
        if product.availability.is_empty() {
            product.availability = if quantity > 0 {
                "in stock".to_string()
            } else {
                "out of stock".to_string()
            };
        }
    }
    product
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<products>
  <product>
    <id>1001</id>
    <name>Puzzle 1000 piese &amp; ramă</name>
    <description><![CDATA[<b>Puzzle</b> pentru adulți]]></description>
    <url>https://shop.example/p/1001</url>
    <price_b2c>59.90</price_b2c>
    <price>49.90</price>
    <quantity>3</quantity>
    <brand>Ravensburger</brand>
    <avatar>https://shop.example/i/1001.jpg</avatar>
    <model>RV-1001</model>
    <categories>
      <category>Jucării</category>
      <category>Puzzle-uri</category>
    </categories>
    <weight>0.8</weight>
  </product>
  <product>
    <id>1002</id>
    <name>Minge</name>
    <quantity>0</quantity>
  </product>
</products>"#;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:g="http://base.google.com/ns/1.0">
  <channel>
    <title>Shop</title>
    <item>
      <g:id>A-1</g:id>
      <title>Mașinuță RC</title>
      <link>https://shop.example/a-1</link>
      <g:price>120.00 RON</g:price>
      <g:availability>in stock</g:availability>
      <g:brand>Maisto</g:brand>
      <g:image_link>https://shop.example/a-1.jpg</g:image_link>
      <g:google_product_category>Toys &gt; Vehicles</g:google_product_category>
      <category>Mașinuțe</category>
      <g:gtin>5901234123457</g:gtin>
      <g:condition>new</g:condition>
    </item>
    <item>
      <guid>B-2</guid>
      <title>Carte</title>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_catalog_layout() {
        let products = parse_feed(CATALOG.as_bytes()).unwrap();
        assert_eq!(products.len(), 2);

        let p = &products[0];
        assert_eq!(p.id, "1001");
        assert_eq!(p.sku, "1001");
        assert_eq!(p.title, "Puzzle 1000 piese & ramă");
        assert_eq!(p.description, "<b>Puzzle</b> pentru adulți");
        assert_eq!(p.price, "59.90");
        assert_eq!(p.stock_quantity, 3);
        assert_eq!(p.availability, "in stock");
        assert_eq!(p.image, "https://shop.example/i/1001.jpg");
        assert_eq!(p.mpn, "RV-1001");
        assert_eq!(p.original_categories, vec!["Jucării", "Puzzle-uri"]);
        assert_eq!(p.extra.get("weight").map(String::as_str), Some("0.8"));

        assert_eq!(products[1].availability, "out of stock");
    }

    #[test]
    fn test_rss_layout() {
        let products = parse_feed(RSS.as_bytes()).unwrap();
        assert_eq!(products.len(), 2);

        let p = &products[0];
        assert_eq!(p.sku, "A-1");
        assert_eq!(p.title, "Mașinuță RC");
        assert_eq!(p.price, "120.00 RON");
        assert_eq!(p.brand, "Maisto");
        assert_eq!(p.gtin, "5901234123457");
        assert_eq!(p.original_categories, vec!["Toys > Vehicles", "Mașinuțe"]);
        assert_eq!(p.extra.get("g:condition").map(String::as_str), Some("new"));

        // Channel title is not a product field.
        assert_eq!(products[1].sku, "B-2");
        assert_eq!(products[1].title, "Carte");
    }

    #[test]
    fn test_unknown_root() {
        let err = parse_feed(b"<catalogue><x/></catalogue>").unwrap_err();
        assert!(matches!(err, ParseError::UnknownLayout(ref root) if root == "catalogue"));
        assert!(matches!(
            parse_feed(b"").unwrap_err(),
            ParseError::UnknownLayout(_)
        ));
    }

    #[test]
    fn test_malformed_xml() {
        let err = parse_feed(b"<products><product><id>1</name></product></products>").unwrap_err();
        assert!(matches!(err, ParseError::Xml { .. }));

        let err = parse_feed(b"<products><product><id>1</id>").unwrap_err();
        assert!(matches!(err, ParseError::Xml { .. }));
    }

    #[test]
    fn test_invalid_utf8() {
        assert!(matches!(
            parse_feed(&[0x3c, 0xff, 0xfe]).unwrap_err(),
            ParseError::Encoding
        ));
    }

    #[test]
    fn test_empty_feed() {
        assert!(parse_feed(b"<products></products>").unwrap().is_empty());
        assert!(parse_feed(b"<products/>").unwrap().is_empty());
    }
}
