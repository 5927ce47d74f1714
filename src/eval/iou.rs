use crate::model::BoundingBox;

pub fn calculate_iou(first: Option<&BoundingBox>, second: Option<&BoundingBox>) -> f64 {
    let (Some(first), Some(second)) = (first, second) else {
        return 0.0;
    };
    box_iou(first, second)
}

pub fn box_iou(first: &BoundingBox, second: &BoundingBox) -> f64 {
    let first_area = first.area();
    let second_area = second.area();
    if first_area <= 0.0 || second_area <= 0.0 {
        return 0.0;
    }

    let x_left = first.x_min.max(second.x_min);
    let y_top = first.y_min.max(second.y_min);
    let x_right = first.x_max.min(second.x_max);
    let y_bottom = first.y_max.min(second.y_max);
    if x_right < x_left || y_bottom < y_top {
        return 0.0;
    }

    let intersection = (x_right - x_left) * (y_bottom - y_top);
    let union = first_area + second_area - intersection;
    if union <= 0.0 {
        return 0.0;
    }

    intersection / union
}
