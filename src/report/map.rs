use std::fmt::Write as _;
use crate::network::geo::Coordinates;
use crate::pipeline::MapPoint;

const WIDTH: f64 = 1000.0;
const HEIGHT: f64 = 500.0;

/// Equirectangular (plate carrée) projection onto the canvas.
fn project(coords: Coordinates) -> (f64, f64) {
    let x = (coords.longitude + 180.0) / 360.0 * WIDTH;
    let y = (90.0 - coords.latitude) / 180.0 * HEIGHT;
    (x, y)
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Arc control point: the chord midpoint lifted by a fifth of its length.
fn control_point(from: (f64, f64), to: (f64, f64)) -> (f64, f64) {
    let mid = ((from.0 + to.0) / 2.0, (from.1 + to.1) / 2.0);
    let (dx, dy) = (to.0 - from.0, to.1 - from.1);
    let lift = (dx * dx + dy * dy).sqrt() / 5.0;
    (mid.0, (mid.1 - lift).max(0.0))
}

/// Renders a world map with a marker at `home` and one dashed arc plus
/// label per point.
pub fn render_map_svg(home: Coordinates, points: &[MapPoint]) -> String {
    let mut svg = String::new();

    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = WIDTH,
        h = HEIGHT
    );
    let _ = writeln!(svg, r#"  <rect width="100%" height="100%" fill="black"/>"#);

    let _ = writeln!(svg, r#"  <g stroke="cyan" stroke-width="0.5" stroke-opacity="0.4">"#);
    for lon in (-180..=180).step_by(30) {
        let (x, _) = project(Coordinates { latitude: 0.0, longitude: lon as f64 });
        let _ = writeln!(svg, r#"    <line x1="{x:.1}" y1="0" x2="{x:.1}" y2="{HEIGHT}"/>"#);
    }
    for lat in (-90..=90).step_by(30) {
        let (_, y) = project(Coordinates { latitude: lat as f64, longitude: 0.0 });
        let _ = writeln!(svg, r#"    <line x1="0" y1="{y:.1}" x2="{WIDTH}" y2="{y:.1}"/>"#);
    }
    let _ = writeln!(svg, "  </g>");

    let origin = project(home);
    for point in points {
        let target = project(point.coordinates);
        let ctrl = control_point(origin, target);
        let _ = writeln!(
            svg,
            r#"  <path d="M {:.1} {:.1} Q {:.1} {:.1} {:.1} {:.1}" fill="none" stroke="lime" stroke-width="1" stroke-dasharray="4 3"/>"#,
            origin.0, origin.1, ctrl.0, ctrl.1, target.0, target.1
        );
        let _ = writeln!(
            svg,
            r#"  <text x="{:.1}" y="{:.1}" fill="white" font-size="8" dominant-baseline="middle">{}</text>"#,
            target.0 + 3.0,
            target.1,
            escape(&point.label)
        );
    }

    let _ = writeln!(
        svg,
        r#"  <circle cx="{:.1}" cy="{:.1}" r="5" fill="red"/>"#,
        origin.0, origin.1
    );
    svg.push_str("</svg>\n");
    svg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(lat: f64, lon: f64, label: &str) -> MapPoint {
        MapPoint {
            coordinates: Coordinates::new(lat, lon).unwrap(),
            label: label.to_string(),
            distance_km: 0.0,
            connections: 1,
        }
    }

    #[test]
    fn test_projection_corners() {
        assert_eq!(project(Coordinates { latitude: 90.0, longitude: -180.0 }), (0.0, 0.0));
        assert_eq!(project(Coordinates { latitude: 0.0, longitude: 0.0 }), (500.0, 250.0));
        assert_eq!(project(Coordinates { latitude: -90.0, longitude: 180.0 }), (1000.0, 500.0));
    }

    #[test]
    fn test_one_arc_and_label_per_point() {
        let home = Coordinates::new(8.2503495, 124.2547768).unwrap();
        let points = vec![
            point(42.1596, -70.8217, "Norwell, Massachusetts, US"),
            point(-33.8688, 151.2093, "Sydney, AU"),
        ];

        let svg = render_map_svg(home, &points);

        assert_eq!(svg.matches("<path").count(), 2);
        assert_eq!(svg.matches("stroke-dasharray").count(), 2);
        assert_eq!(svg.matches("<circle").count(), 1);
        assert!(svg.contains(">Norwell, Massachusetts, US</text>"));
        assert!(svg.ends_with("</svg>\n"));
    }

    #[test]
    fn test_labels_are_escaped() {
        let home = Coordinates::new(0.0, 0.0).unwrap();
        let svg = render_map_svg(home, &[point(1.0, 1.0, "AT&T <Services>")]);
        assert!(svg.contains("AT&amp;T &lt;Services&gt;"));
    }
}
